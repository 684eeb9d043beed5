//! Broker-backed work queue.
//!
//! Unlike a Postgres-only job table used directly as the queue, this
//! component keeps the broker's state strictly limited to "work
//! pointers": a Redis Stream carries
//! `(scan_job_id)` entries, a consumer group gives each worker its own
//! pending-entries list, and `XCLAIM`/`XAUTOCLAIM` redeliver entries whose
//! owning worker died before acking. All job state itself lives in the
//! Store; the queue never duplicates it, so a crashed worker's in-flight
//! entries redeliver as bare ids and the Dispatcher re-reads the
//! authoritative ScanJob row before acting on them.

mod redis_queue;

pub use redis_queue::{QueueEntry, RedisQueue, PRIORITIES};
