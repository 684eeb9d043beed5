use crate::model::Disposition;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Clone)]
pub struct FailedCommitsRepo {
    pool: PgPool,
}

impl FailedCommitsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Writes (or refreshes) a FailedCommit row in the same transaction the
    /// caller uses to move the ScanJob to FAILED_PERMANENT, so the two
    /// writes commit atomically. Idempotent on scan_job_id: reconciler
    /// backfill and a direct permanent failure both land here.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        scan_job_id: Uuid,
        error_class: &str,
        error: &str,
        scanner_log_path: Option<&str>,
    ) -> anyhow::Result<Uuid> {
        let rec = sqlx::query!(
            r#"
            INSERT INTO failed_commits (scan_job_id, last_error_class, last_error, scanner_log_path, disposition)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (scan_job_id) DO UPDATE
                SET last_error_class = EXCLUDED.last_error_class,
                    last_error = EXCLUDED.last_error,
                    scanner_log_path = EXCLUDED.scanner_log_path,
                    updated_at = now()
            RETURNING id
            "#,
            scan_job_id,
            error_class,
            error,
            scanner_log_path,
        )
        .fetch_one(&mut **tx)
        .await?;

        Ok(rec.id)
    }

    pub async fn get_by_job(&self, scan_job_id: Uuid) -> anyhow::Result<Option<crate::model::FailedCommit>> {
        let row = sqlx::query_as::<_, crate::model::FailedCommit>(
            "SELECT * FROM failed_commits WHERE scan_job_id = $1",
        )
        .bind(scan_job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_pending(&self) -> anyhow::Result<Vec<crate::model::FailedCommit>> {
        let rows = sqlx::query_as::<_, crate::model::FailedCommit>(
            "SELECT * FROM failed_commits WHERE disposition = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Marks the dead-letter record as requeued for an operator-initiated
    /// retry; the paired ScanJob transition happens via ScanJobsRepo::operator_retry.
    pub async fn mark_requeued(
        &self,
        scan_job_id: Uuid,
        config_override: Option<Value>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE failed_commits
            SET disposition = $2,
                operator_config_override = COALESCE($3, operator_config_override),
                updated_at = now()
            WHERE scan_job_id = $1
            "#,
        )
        .bind(scan_job_id)
        .bind(Disposition::Queued.as_str())
        .bind(config_override)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_resolved(&self, scan_job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE failed_commits SET disposition = $2, updated_at = now() WHERE scan_job_id = $1",
        )
        .bind(scan_job_id)
        .bind(Disposition::Resolved.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
