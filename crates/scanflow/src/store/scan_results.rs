use crate::model::ScanResult;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct ScanResultsRepo {
    pool: PgPool,
}

impl ScanResultsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent by scan_job_id: a duplicate MetricsFetcher run for the
    /// same job overwrites the metrics payload rather than erroring, so a
    /// replayed fetch after a worker crash is harmless.
    pub async fn upsert(
        &self,
        scan_job_id: Uuid,
        analysis_key: &str,
        analysis_id: &str,
        metrics: Value,
    ) -> anyhow::Result<Uuid> {
        let rec = sqlx::query!(
            r#"
            INSERT INTO scan_results (scan_job_id, analysis_key, analysis_id, metrics)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (scan_job_id) DO UPDATE
                SET analysis_key = EXCLUDED.analysis_key,
                    analysis_id = EXCLUDED.analysis_id,
                    metrics = EXCLUDED.metrics,
                    fetched_at = now()
            RETURNING id
            "#,
            scan_job_id,
            analysis_key,
            analysis_id,
            metrics,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(rec.id)
    }

    pub async fn get_for_job(&self, scan_job_id: Uuid) -> anyhow::Result<Option<ScanResult>> {
        let result =
            sqlx::query_as::<_, ScanResult>("SELECT * FROM scan_results WHERE scan_job_id = $1")
                .bind(scan_job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(result)
    }

    pub async fn list_for_project(&self, project_id: Uuid) -> anyhow::Result<Vec<ScanResult>> {
        let results = sqlx::query_as::<_, ScanResult>(
            r#"
            SELECT r.*
            FROM scan_results r
            JOIN scan_jobs j ON j.id = r.scan_job_id
            WHERE j.project_id = $1
            ORDER BY r.fetched_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(results)
    }
}
