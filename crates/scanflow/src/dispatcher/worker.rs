use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, InstanceConfig};
use crate::error::{ScanError, ScanErrorClass};
use crate::lock::LockManager;
use crate::metrics_fetcher::MetricsFetcher;
use crate::model::ScanJob;
use crate::queue::RedisQueue;
use crate::repo_cache::RepoCache;
use crate::retry::{next_delay_ms, RetryConfig};
use crate::scanner::Scanner;
use crate::store::{FailedCommitsRepo, ProjectsRepo, ScanJobsRepo, ScanResultsRepo};
use crate::webhook::Notifiers;

/// Drains the queue and runs each claimed ScanJob through checkout, scan
/// submission, webhook-correlated completion, and metrics collection. One
/// Dispatcher instance runs per worker process; `run_forever` spawns a
/// concurrent task per claimed entry so a slow scan on one instance doesn't
/// block dispatch of work destined for another.
#[derive(Clone)]
pub struct Dispatcher {
    scan_jobs: ScanJobsRepo,
    scan_results: ScanResultsRepo,
    failed_commits: FailedCommitsRepo,
    projects: ProjectsRepo,
    queue: RedisQueue,
    lock: LockManager,
    repo_cache: Arc<RepoCache>,
    scanners: Arc<HashMap<String, Scanner>>,
    instances: Arc<HashMap<String, InstanceConfig>>,
    metrics_fetcher: Arc<MetricsFetcher>,
    notifiers: Notifiers,
    config: Arc<Config>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scan_jobs: ScanJobsRepo,
        scan_results: ScanResultsRepo,
        failed_commits: FailedCommitsRepo,
        projects: ProjectsRepo,
        queue: RedisQueue,
        lock: LockManager,
        repo_cache: RepoCache,
        metrics_fetcher: MetricsFetcher,
        notifiers: Notifiers,
        config: Arc<Config>,
    ) -> Self {
        let scanners = config
            .instances
            .iter()
            .map(|i| (i.name.clone(), Scanner::new(i.scanner_path.clone())))
            .collect();
        let instances = config.instances.iter().map(|i| (i.name.clone(), i.clone())).collect();

        Self {
            scan_jobs,
            scan_results,
            failed_commits,
            projects,
            queue,
            lock,
            repo_cache: Arc::new(repo_cache),
            scanners: Arc::new(scanners),
            instances: Arc::new(instances),
            metrics_fetcher: Arc::new(metrics_fetcher),
            notifiers,
            config,
        }
    }

    pub async fn run_forever(self) {
        let reclaim_every = Duration::from_secs((self.config.lease_ttl_seconds.max(1) as u64) / 2);
        let mut last_reclaim = tokio::time::Instant::now() - reclaim_every;

        loop {
            let mut q = self.queue.clone();

            if last_reclaim.elapsed() >= reclaim_every {
                last_reclaim = tokio::time::Instant::now();
                match q.reclaim_stale(&self.config.worker_id, reclaim_every.as_millis() as usize, 32).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(count = reclaimed.len(), "reclaimed stale queue entries from a dead consumer");
                        self.spawn_entries(reclaimed);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "failed to reclaim stale queue entries"),
                }
            }

            let entries = match q.claim(&self.config.worker_id, 8, 5_000).await {
                Ok(e) => e,
                Err(e) => {
                    error!(error = %e, "failed to claim from queue");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            self.spawn_entries(entries);
        }
    }

    fn spawn_entries(&self, entries: Vec<crate::queue::QueueEntry>) {
        for entry in entries {
            let this = self.clone();
            tokio::spawn(async move {
                match this.handle_job(entry.scan_job_id).await {
                    Ok(()) => {
                        let mut q = this.queue.clone();
                        let _ = q.ack(&entry).await;
                    }
                    Err(e) if matches!(e.downcast_ref::<ScanError>(), Some(ScanError::NoSlotAvailable)) => {
                        // Every instance was saturated. Ack the current delivery
                        // and re-enqueue to the `retry` class after a backoff
                        // delay instead of leaving it pending on the stream, so
                        // a string of no-slot attempts doesn't pile up in one
                        // consumer's PEL.
                        let mut q = this.queue.clone();
                        let _ = q.ack(&entry).await;

                        let delay_ms = this.config.no_slot_requeue_delay_ms;
                        let scan_job_id = entry.scan_job_id;
                        let mut requeue_queue = this.queue.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            let _ = requeue_queue.enqueue_with_priority(scan_job_id, "retry").await;
                        });
                    }
                    Err(e) => {
                        warn!(scan_job_id = %entry.scan_job_id, error = %e, "dispatch attempt failed");
                        // Left un-acked; XAUTOCLAIM redelivers after the idle
                        // threshold so a crashed handler doesn't lose the job.
                    }
                }
            });
        }
    }

    async fn handle_job(&self, scan_job_id: Uuid) -> anyhow::Result<()> {
        let Some(job) = self.scan_jobs.get(scan_job_id).await? else {
            return Ok(());
        };

        if job.state != "queued" {
            // Stale or duplicate delivery; the job already moved on.
            return Ok(());
        }

        let Some(ticket) = self.lock.acquire(job.id, self.config.lease_ttl_seconds).await? else {
            return Err(ScanError::NoSlotAvailable.into());
        };

        let outcome = self.run_leased(&job, &ticket).await;

        let _ = self.lock.release(&ticket.instance_name, ticket.slot_index, ticket.lease_token).await;
        self.projects.recompute_status(job.project_id).await.ok();

        outcome
    }

    async fn run_leased(
        &self,
        job: &ScanJob,
        ticket: &crate::lock::LockTicket,
    ) -> anyhow::Result<()> {
        use crate::store::scan_jobs::WriteOutcome;

        let transition = self
            .scan_jobs
            .start_running(job.id, job.attempts, &ticket.instance_name, self.config.lease_ttl_seconds)
            .await?;
        if transition == WriteOutcome::Conflict {
            return Ok(());
        }

        let result = self.execute(job, ticket).await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    async fn execute(&self, job: &ScanJob, ticket: &crate::lock::LockTicket) -> Result<(), ScanError> {
        let instance = self
            .instances
            .get(&ticket.instance_name)
            .ok_or_else(|| ScanError::MalformedConfig(format!("unknown instance {}", ticket.instance_name)))?;
        let scanner = self
            .scanners
            .get(&ticket.instance_name)
            .ok_or_else(|| ScanError::MalformedConfig(format!("no scanner configured for {}", ticket.instance_name)))?;

        let clone_url = self.config.vcs_clone_url_template.replace("{slug}", &job.repo_slug);
        let repo_cache = self.repo_cache.clone();
        let repo_slug = job.repo_slug.clone();
        let clone_url_owned = clone_url.clone();
        tokio::task::spawn_blocking(move || repo_cache.ensure_mirror(&repo_slug, &clone_url_owned))
            .await
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))??;

        let repo_cache = self.repo_cache.clone();
        let repo_slug = job.repo_slug.clone();
        let commit_sha = job.commit_sha.clone();
        let checkout = tokio::task::spawn_blocking(move || repo_cache.checkout(&repo_slug, &commit_sha))
            .await
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))??;

        let project = self
            .projects
            .get(job.project_id)
            .await
            .map_err(ScanError::Other)?
            .ok_or_else(|| ScanError::MalformedConfig(format!("project {} not found", job.project_id)))?;
        let resolved_config =
            self.config.resolve_scan_config(job.config_override.as_ref(), project.config_override.as_ref())?;

        let component_key = job.component_key();
        let log_path = format!("{}/{}.log", self.config.repo_cache_dir, job.id);
        let outcome = scanner
            .run(
                &checkout.path,
                &component_key,
                &instance.host,
                &instance.token,
                resolved_config.as_ref(),
                &log_path,
                self.config.scan_timeout(),
            )
            .await?;

        self.scan_jobs.set_scanner_log_path(job.id, &log_path).await.map_err(ScanError::Other)?;

        let transition = self
            .scan_jobs
            .record_submission_id(job.id, &outcome.submission_id)
            .await
            .map_err(ScanError::Other)?;
        if transition == crate::store::scan_jobs::WriteOutcome::Conflict {
            return Err(ScanError::LeaseExpired);
        }

        self.wait_for_completion(job, &outcome.submission_id, instance, ticket).await
    }

    async fn wait_for_completion(
        &self,
        job: &ScanJob,
        analysis_id: &str,
        instance: &InstanceConfig,
        ticket: &crate::lock::LockTicket,
    ) -> Result<(), ScanError> {
        let waiter = self.notifiers.register(job.id).await;

        let heartbeat_lock = self.lock.clone();
        let heartbeat_jobs = self.scan_jobs.clone();
        let heartbeat_instance = ticket.instance_name.clone();
        let heartbeat_slot = ticket.slot_index;
        let heartbeat_token = ticket.lease_token;
        let heartbeat_job_id = job.id;
        let lease_ttl = self.config.lease_ttl_seconds;
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs((lease_ttl / 3).max(1) as u64)).await;
                let _ = heartbeat_lock.heartbeat(&heartbeat_instance, heartbeat_slot, heartbeat_token, lease_ttl).await;
                let _ = heartbeat_jobs.heartbeat(heartbeat_job_id, &heartbeat_instance, lease_ttl).await;
            }
        });

        let wait_result = tokio::time::timeout(self.config.wait_for_webhook_timeout(), waiter.wait()).await;
        heartbeat_task.abort();

        if wait_result.is_err() {
            return Err(ScanError::LeaseExpired);
        }

        let refreshed = self
            .scan_jobs
            .get(job.id)
            .await
            .map_err(ScanError::Other)?
            .ok_or(ScanError::StoreConflict)?;

        if refreshed.state != "running" {
            // Already resolved by a concurrent path (e.g. reconciler).
            return Ok(());
        }

        // Only a SUCCESS completion triggers the metrics fetch; anything
        // else (FAILED, etc.) is a retryable analysis-side failure and
        // must not touch the metrics endpoint or the ScanResult table.
        match waiter.status().await.as_deref() {
            Some("SUCCESS") => self.fetch_metrics_and_finish(&refreshed, analysis_id, instance).await,
            Some(other) => Err(ScanError::AnalysisFailed(other.to_string())),
            None => Err(ScanError::AnalysisFailed("webhook status unavailable".to_string())),
        }
    }

    async fn fetch_metrics_and_finish(
        &self,
        job: &ScanJob,
        analysis_id: &str,
        instance: &InstanceConfig,
    ) -> Result<(), ScanError> {
        let component_key = job.component_key();
        let metrics = self
            .metrics_fetcher
            .fetch(&instance.host, &instance.token, &component_key, &self.config.metrics)
            .await?;

        self.scan_results
            .upsert(job.id, &component_key, analysis_id, metrics)
            .await
            .map_err(ScanError::Other)?;

        let transition = self.scan_jobs.mark_succeeded(job.id).await.map_err(ScanError::Other)?;
        if transition == crate::store::scan_jobs::WriteOutcome::Conflict {
            return Err(ScanError::StoreConflict);
        }

        // A no-op if this job was never dead-lettered; resolves the
        // FailedCommit row when an operator-retried commit finally succeeds.
        self.failed_commits.mark_resolved(job.id).await.map_err(ScanError::Other)?;

        info!(scan_job_id = %job.id, "scan succeeded");
        Ok(())
    }

    async fn handle_failure(&self, job: &ScanJob, err: ScanError) -> anyhow::Result<()> {
        let class = err.class();
        let code = err.code();
        let message = err.to_string();

        // `job` was loaded in `handle_job` before `start_running` incremented
        // `attempts` in the database, so `job.attempts` here is the
        // pre-increment count (the number of attempts *before* this run).
        // The run that just failed counts as `job.attempts + 1` total
        // attempts; compare that post-increment count against max_retries so
        // this matches the Reconciler's check (which reads a freshly-loaded,
        // already-incremented row) instead of granting one extra attempt.
        let attempts_after_this_run = job.attempts + 1;

        match class {
            ScanErrorClass::Retryable if attempts_after_this_run <= job.max_retries => {
                self.scan_jobs.mark_failed_temp(job.id, code, &message).await?;

                let retry_cfg = RetryConfig {
                    base_ms: self.config.retry_backoff_base_ms,
                    cap_ms: self.config.retry_backoff_cap_ms,
                    jitter_ratio: self.config.retry_jitter_ratio,
                };
                let mut rng = StdRng::from_entropy();
                let delay_ms = next_delay_ms(attempts_after_this_run, &retry_cfg, &mut rng);

                let scan_jobs = self.scan_jobs.clone();
                let mut queue = self.queue.clone();
                let job_id = job.id;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if scan_jobs.requeue_after_failure(job_id).await.is_ok() {
                        let _ = queue.enqueue_with_priority(job_id, "retry").await;
                    }
                });

                Ok(())
            }
            _ => {
                let mut tx = self.scan_jobs.begin().await?;
                self.scan_jobs.mark_failed_permanent(&mut tx, job.id, code, &message).await?;
                self.failed_commits
                    .insert_in_tx(&mut tx, job.id, code, &message, job.scanner_log_path.as_deref())
                    .await?;
                tx.commit().await?;

                error!(scan_job_id = %job.id, error_class = ?class, code, "scan failed permanently");
                Ok(())
            }
        }
    }
}
