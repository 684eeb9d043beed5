use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

const GROUP_NAME: &str = "scanflow-workers";

/// The three priority classes, checked in this order by `claim` so
/// `high` work always drains before `normal`, and `normal` before
/// backoff-delayed `retry` redeliveries. Each class is a
/// distinct Redis stream + consumer group rather than a field on one
/// stream's entries, so a saturated `normal` backlog can never starve a
/// `high`-priority submission behind it in FIFO order.
pub const PRIORITIES: [&str; 3] = ["high", "normal", "retry"];

fn stream_key(priority: &str) -> String {
    format!("scanflow:scan_jobs:{priority}")
}

fn normalize(priority: &str) -> &str {
    if PRIORITIES.contains(&priority) {
        priority
    } else {
        "normal"
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub stream_id: String,
    pub priority: String,
    pub scan_job_id: Uuid,
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        let mut queue = Self { conn };
        for priority in PRIORITIES {
            queue.ensure_group(&stream_key(priority)).await?;
        }
        Ok(queue)
    }

    async fn ensure_group(&mut self, stream: &str) -> anyhow::Result<()> {
        let res: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(GROUP_NAME)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        // BUSYGROUP means the group already exists, which is fine on restart.
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn enqueue(&mut self, scan_job_id: Uuid) -> anyhow::Result<String> {
        self.enqueue_with_priority(scan_job_id, "normal").await
    }

    pub async fn enqueue_with_priority(
        &mut self,
        scan_job_id: Uuid,
        priority: &str,
    ) -> anyhow::Result<String> {
        let priority = normalize(priority);
        let id: String = self
            .conn
            .xadd(stream_key(priority), "*", &[("scan_job_id", scan_job_id.to_string())])
            .await?;
        Ok(id)
    }

    /// Reads up to `count` new entries for `consumer_name`, preferring
    /// `high` then `normal` then `retry` streams and blocking up to
    /// `block_ms` only on the last (lowest-priority) one checked empty, so
    /// a busy `high` stream is never starved by a long block on a quiet
    /// one. Entries stay in the consumer group's pending-entries list
    /// until `ack`.
    pub async fn claim(
        &mut self,
        consumer_name: &str,
        count: usize,
        block_ms: usize,
    ) -> anyhow::Result<Vec<QueueEntry>> {
        for (i, priority) in PRIORITIES.iter().enumerate() {
            let block = if i == PRIORITIES.len() - 1 { block_ms } else { 0 };
            let opts = redis::streams::StreamReadOptions::default()
                .group(GROUP_NAME, consumer_name)
                .count(count)
                .block(block);

            let reply: redis::streams::StreamReadReply = self
                .conn
                .xread_options(&[stream_key(priority)], &[">"], &opts)
                .await?;

            let entries = parse_entries(reply, priority);
            if !entries.is_empty() {
                return Ok(entries);
            }
        }

        Ok(Vec::new())
    }

    pub async fn ack(&mut self, entry: &QueueEntry) -> anyhow::Result<()> {
        let _: i64 = self
            .conn
            .xack(stream_key(&entry.priority), GROUP_NAME, &[&entry.stream_id])
            .await?;
        Ok(())
    }

    /// Claims entries idle for at least `min_idle_ms` from any consumer,
    /// including dead ones, handing them back to `consumer_name` across
    /// every priority stream. This is the Redis analogue of the
    /// Reconciler's lease-expiry sweep: it is how a job dispatched by a
    /// worker that crashed mid-scan becomes available again without
    /// operator intervention.
    pub async fn reclaim_stale(
        &mut self,
        consumer_name: &str,
        min_idle_ms: usize,
        count: usize,
    ) -> anyhow::Result<Vec<QueueEntry>> {
        let mut out = Vec::new();
        for priority in PRIORITIES {
            let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
                .arg(stream_key(priority))
                .arg(GROUP_NAME)
                .arg(consumer_name)
                .arg(min_idle_ms)
                .arg("0-0")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut self.conn)
                .await?;

            out.extend(reply.claimed.into_iter().filter_map(|id| {
                let scan_job_id = id
                    .map
                    .get("scan_job_id")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .and_then(|s| Uuid::parse_str(&s).ok())?;
                Some(QueueEntry {
                    stream_id: id.id,
                    priority: priority.to_string(),
                    scan_job_id,
                })
            }));
        }
        Ok(out)
    }

    pub async fn pending_count(&mut self) -> anyhow::Result<i64> {
        let mut total = 0i64;
        for priority in PRIORITIES {
            let reply: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(stream_key(priority))
                .arg(GROUP_NAME)
                .arg("-")
                .arg("+")
                .arg(10_000)
                .query_async(&mut self.conn)
                .await?;
            total += reply.ids.len() as i64;
        }
        Ok(total)
    }
}

fn parse_entries(reply: redis::streams::StreamReadReply, priority: &str) -> Vec<QueueEntry> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            if let Some(scan_job_id) = id
                .map
                .get("scan_job_id")
                .and_then(|v| redis::from_redis_value::<String>(v).ok())
                .and_then(|s| Uuid::parse_str(&s).ok())
            {
                out.push(QueueEntry {
                    stream_id: id.id,
                    priority: priority.to_string(),
                    scan_job_id,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_falls_back_to_normal_for_unknown_class() {
        assert_eq!(normalize("urgent"), "normal");
        assert_eq!(normalize("high"), "high");
        assert_eq!(normalize("retry"), "retry");
    }

    #[test]
    fn stream_key_is_namespaced_per_priority() {
        assert_eq!(stream_key("high"), "scanflow:scan_jobs:high");
        assert_ne!(stream_key("high"), stream_key("normal"));
    }
}
