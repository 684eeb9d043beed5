// Persistence + optimistic state transitions for ScanJob.
//
// Every transition predicates its UPDATE on (id, expected state, expected
// attempts) and reports back whether it actually moved a row, guarding on
// state plus attempts so duplicate webhook/queue deliveries can never
// apply the same transition twice.

use crate::model::{NewScanJob, ScanJob};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct ScanJobsRepo {
    pool: PgPool,
}

/// Outcome of a conditional state-transition write: `Applied` when the
/// predicate matched and the row moved, `Conflict` when it did not (the
/// caller must re-read and decide whether to retry or treat it as a no-op).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Conflict,
}

impl ScanJobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a ScanJob in PENDING. Violates the (project_id, commit_sha)
    /// uniqueness constraint is surfaced to the caller as an error; the
    /// Ingestor treats that as "already enumerated, skip".
    pub async fn create(&self, job: NewScanJob) -> anyhow::Result<Uuid> {
        let rec = sqlx::query!(
            r#"
            INSERT INTO scan_jobs (
                project_id, repo_slug, commit_sha, branch,
                state, priority, max_retries, config_override
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING id
            "#,
            job.project_id,
            job.repo_slug,
            job.commit_sha,
            job.branch,
            job.priority,
            job.max_retries,
            job.config_override,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(rec.id)
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<ScanJob>> {
        let job = sqlx::query_as::<_, ScanJob>("SELECT * FROM scan_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn get_by_project_commit(
        &self,
        project_id: Uuid,
        commit_sha: &str,
    ) -> anyhow::Result<Option<ScanJob>> {
        let job = sqlx::query_as::<_, ScanJob>(
            "SELECT * FROM scan_jobs WHERE project_id = $1 AND commit_sha = $2",
        )
        .bind(project_id)
        .bind(commit_sha)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn list_for_project(&self, project_id: Uuid) -> anyhow::Result<Vec<ScanJob>> {
        let jobs = sqlx::query_as::<_, ScanJob>(
            "SELECT * FROM scan_jobs WHERE project_id = $1 ORDER BY created_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Cursor-paginated read model over scan_jobs, keyed on a
    /// (created_at, id) DESC cursor.
    pub async fn list_paginated(
        &self,
        state: Option<&str>,
        limit: i64,
        cursor_created_at: Option<DateTime<Utc>>,
        cursor_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<ScanJob>> {
        let limit = limit.clamp(1, 500);

        let rows = match (state, cursor_created_at, cursor_id) {
            (Some(st), Some(ca), Some(cid)) => {
                sqlx::query_as::<_, ScanJob>(
                    r#"
                    SELECT * FROM scan_jobs
                    WHERE state = $1 AND (created_at, id) < ($2, $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(st)
                .bind(ca)
                .bind(cid)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(st), _, _) => {
                sqlx::query_as::<_, ScanJob>(
                    "SELECT * FROM scan_jobs WHERE state = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
                )
                .bind(st)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(ca), Some(cid)) => {
                sqlx::query_as::<_, ScanJob>(
                    r#"
                    SELECT * FROM scan_jobs
                    WHERE (created_at, id) < ($1, $2)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $3
                    "#,
                )
                .bind(ca)
                .bind(cid)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, _, _) => {
                sqlx::query_as::<_, ScanJob>(
                    "SELECT * FROM scan_jobs ORDER BY created_at DESC, id DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    pub async fn mark_queued(&self, id: Uuid) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'queued', updated_at = now()
            WHERE id = $1 AND state IN ('pending', 'failed_temp', 'failed_permanent')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    /// QUEUED -> RUNNING, writing the lease atomically on the job row.
    /// Predicated on (id, state=queued, attempts) so a duplicate dispatch
    /// of the same queue message is a no-op conflict, not a double-start.
    pub async fn start_running(
        &self,
        id: Uuid,
        expected_attempts: i32,
        instance: &str,
        lease_ttl_seconds: i64,
    ) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'running',
                attempts = attempts + 1,
                lease_instance = $3,
                lease_analysis_id = NULL,
                lease_acquired_at = now(),
                lease_expires_at = now() + ($4::bigint * interval '1 second'),
                updated_at = now()
            WHERE id = $1 AND state = 'queued' AND attempts = $2
            "#,
        )
        .bind(id)
        .bind(expected_attempts)
        .bind(instance)
        .bind(lease_ttl_seconds)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    pub async fn heartbeat(&self, id: Uuid, instance: &str, lease_ttl_seconds: i64) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET lease_expires_at = now() + ($3::bigint * interval '1 second'),
                updated_at = now()
            WHERE id = $1 AND state = 'running' AND lease_instance = $2
            "#,
        )
        .bind(id)
        .bind(instance)
        .bind(lease_ttl_seconds)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    /// Records the scanner's submission id on the lease so the webhook can
    /// correlate. Separate from `start_running` because the submission id
    /// is only known after the scanner process starts producing output.
    pub async fn record_submission_id(&self, id: Uuid, analysis_id: &str) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET lease_analysis_id = $2, updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(analysis_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    pub async fn find_running_by_analysis_id(&self, analysis_id: &str) -> anyhow::Result<Option<ScanJob>> {
        let job = sqlx::query_as::<_, ScanJob>(
            "SELECT * FROM scan_jobs WHERE lease_analysis_id = $1 AND state = 'running'",
        )
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn mark_succeeded(&self, id: Uuid) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'succeeded',
                lease_instance = NULL,
                lease_analysis_id = NULL,
                lease_acquired_at = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    /// RUNNING -> FAILED_TEMP, releasing the lease. Caller (Dispatcher /
    /// WebhookIntake / Reconciler) has already classified the failure.
    pub async fn mark_failed_temp(
        &self,
        id: Uuid,
        error_class: &str,
        error: &str,
    ) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'failed_temp',
                lease_instance = NULL,
                lease_analysis_id = NULL,
                lease_acquired_at = NULL,
                lease_expires_at = NULL,
                last_error_class = $2,
                last_error = $3,
                updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(error_class)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    /// FAILED_TEMP -> QUEUED, for retry after backoff.
    pub async fn requeue_after_failure(&self, id: Uuid) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'queued', updated_at = now()
            WHERE id = $1 AND state = 'failed_temp'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    /// FAILED_TEMP (or RUNNING, for a direct non-retryable classification)
    /// -> FAILED_PERMANENT. The FailedCommit write happens in the same
    /// transaction by the caller (see FailedCommitsRepo::backfill_for_job).
    pub async fn mark_failed_permanent(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Uuid,
        error_class: &str,
        error: &str,
    ) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'failed_permanent',
                lease_instance = NULL,
                lease_analysis_id = NULL,
                lease_acquired_at = NULL,
                lease_expires_at = NULL,
                last_error_class = $2,
                last_error = $3,
                updated_at = now()
            WHERE id = $1 AND state IN ('running', 'failed_temp')
            "#,
        )
        .bind(id)
        .bind(error_class)
        .bind(error)
        .execute(&mut **tx)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    /// Operator retry: FAILED_PERMANENT -> QUEUED, attempts reset, with an
    /// optional new configuration override.
    pub async fn operator_retry(
        &self,
        id: Uuid,
        config_override: Option<Value>,
    ) -> anyhow::Result<WriteOutcome> {
        let res = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'queued',
                attempts = 0,
                config_override = COALESCE($2, config_override),
                last_error_class = NULL,
                last_error = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'failed_permanent'
            "#,
        )
        .bind(id)
        .bind(config_override)
        .execute(&self.pool)
        .await?;

        Ok(outcome(res.rows_affected()))
    }

    pub async fn set_scanner_log_path(&self, id: Uuid, path: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE scan_jobs SET scanner_log_path = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Jobs RUNNING whose lease has expired or is absent: candidates for
    /// the Reconciler's lease-expiry sweep.
    pub async fn list_running_with_expired_lease(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScanJob>> {
        let jobs = sqlx::query_as::<_, ScanJob>(
            r#"
            SELECT * FROM scan_jobs
            WHERE state = 'running'
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// QUEUED jobs stuck past the stale-queue threshold: guards against
    /// broker loss.
    pub async fn list_stale_queued(&self, older_than: DateTime<Utc>) -> anyhow::Result<Vec<ScanJob>> {
        let jobs = sqlx::query_as::<_, ScanJob>(
            "SELECT * FROM scan_jobs WHERE state = 'queued' AND updated_at < $1",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn list_failed_permanent_without_failed_commit(&self) -> anyhow::Result<Vec<ScanJob>> {
        let jobs = sqlx::query_as::<_, ScanJob>(
            r#"
            SELECT j.* FROM scan_jobs j
            LEFT JOIN failed_commits fc ON fc.scan_job_id = j.id
            WHERE j.state = 'failed_permanent' AND fc.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn begin(&self) -> anyhow::Result<sqlx::Transaction<'_, sqlx::Postgres>> {
        Ok(self.pool.begin().await?)
    }
}

fn outcome(rows_affected: u64) -> WriteOutcome {
    if rows_affected > 0 {
        WriteOutcome::Applied
    } else {
        WriteOutcome::Conflict
    }
}
