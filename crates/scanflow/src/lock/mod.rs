//! Per-instance concurrency leasing.
//!
//! Each analysis instance exposes a fixed number of concurrency slots
//! (`InstanceConfig::concurrency_cap`). `instance_locks` holds exactly
//! `concurrency_cap` rows per instance, one per slot, seeded empty. Acquiring
//! a lease is `SELECT ... FOR UPDATE SKIP LOCKED` over free-or-expired slots
//! for the chosen instance, candidate-select and claim done inside one
//! transaction: one row per slot rather than one row per job.
//!
//! Instance selection itself is round robin over `lock_cursor`, a singleton
//! row recording the last instance tried, so load is spread evenly across
//! the pool instead of hammering the first configured instance whenever it
//! has free capacity.

mod manager;

pub use manager::{LockManager, LockTicket};
