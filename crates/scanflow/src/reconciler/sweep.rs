use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::config::Config;
use crate::lock::LockManager;
use crate::queue::RedisQueue;
use crate::retry::{next_delay_ms, RetryConfig};
use crate::store::{FailedCommitsRepo, ScanJobsRepo};

/// Periodic sweep that closes the gaps no synchronous path covers: a
/// RUNNING job whose worker died without a webhook ever arriving, a QUEUED
/// job whose broker entry was lost (Redis restart, stream trim), and a
/// FAILED_PERMANENT job whose dead-letter write raced a crash between the
/// ScanJob transition and the FailedCommit insert landing. Mirrors the
/// teacher's maintenance sweep in shape: one repo, one interval, idempotent
/// on every row it touches.
#[derive(Clone)]
pub struct Reconciler {
    scan_jobs: ScanJobsRepo,
    failed_commits: FailedCommitsRepo,
    lock: LockManager,
    queue: RedisQueue,
    config: Arc<Config>,
}

impl Reconciler {
    pub fn new(
        scan_jobs: ScanJobsRepo,
        failed_commits: FailedCommitsRepo,
        lock: LockManager,
        queue: RedisQueue,
        config: Arc<Config>,
    ) -> Self {
        Self {
            scan_jobs,
            failed_commits,
            lock,
            queue,
            config,
        }
    }

    pub async fn run_forever(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.reconciler_interval_seconds));
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "reconciler sweep failed");
            }
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        let expired_locks = self.lock.reap_expired().await?;
        if expired_locks > 0 {
            info!(count = expired_locks, "reaped expired instance locks");
        }

        self.reap_expired_leases().await?;
        self.requeue_stale_queued().await?;
        self.backfill_failed_commits().await?;

        Ok(())
    }

    async fn reap_expired_leases(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let jobs = self.scan_jobs.list_running_with_expired_lease(now).await?;

        for job in jobs {
            self.scan_jobs
                .mark_failed_temp(job.id, "LEASE_EXPIRED", "lease expired without webhook")
                .await?;

            if job.attempts <= job.max_retries {
                let retry_cfg = RetryConfig {
                    base_ms: self.config.retry_backoff_base_ms,
                    cap_ms: self.config.retry_backoff_cap_ms,
                    jitter_ratio: self.config.retry_jitter_ratio,
                };
                let mut rng = StdRng::from_entropy();
                let delay_ms = next_delay_ms(job.attempts, &retry_cfg, &mut rng);
                tokio::time::sleep(Duration::from_millis(delay_ms.min(1_000))).await;

                if self.scan_jobs.requeue_after_failure(job.id).await?
                    == crate::store::scan_jobs::WriteOutcome::Applied
                {
                    let mut queue = self.queue.clone();
                    queue.enqueue_with_priority(job.id, "retry").await?;
                }
            } else {
                let mut tx = self.scan_jobs.begin().await?;
                self.scan_jobs
                    .mark_failed_permanent(&mut tx, job.id, "LEASE_EXPIRED", "lease expired without webhook, retries exhausted")
                    .await?;
                self.failed_commits
                    .insert_in_tx(&mut tx, job.id, "LEASE_EXPIRED", "lease expired without webhook, retries exhausted", None)
                    .await?;
                tx.commit().await?;
            }

            warn!(scan_job_id = %job.id, "reclaimed job with expired lease");
        }

        Ok(())
    }

    async fn requeue_stale_queued(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_queue_threshold_seconds);
        let jobs = self.scan_jobs.list_stale_queued(cutoff).await?;

        let mut queue = self.queue.clone();
        for job in jobs {
            queue.enqueue_with_priority(job.id, &job.priority).await?;
            info!(scan_job_id = %job.id, "re-enqueued stale queued job");
        }

        Ok(())
    }

    async fn backfill_failed_commits(&self) -> anyhow::Result<()> {
        let jobs = self.scan_jobs.list_failed_permanent_without_failed_commit().await?;

        for job in jobs {
            let mut tx = self.scan_jobs.begin().await?;
            self.failed_commits
                .insert_in_tx(
                    &mut tx,
                    job.id,
                    job.last_error_class.as_deref().unwrap_or("UNKNOWN"),
                    job.last_error.as_deref().unwrap_or("no error recorded"),
                    job.scanner_log_path.as_deref(),
                )
                .await?;
            tx.commit().await?;
            info!(scan_job_id = %job.id, "backfilled missing failed_commit record");
        }

        Ok(())
    }
}
