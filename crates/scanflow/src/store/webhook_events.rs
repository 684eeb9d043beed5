use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct WebhookEventsRepo {
    pool: PgPool,
}

impl WebhookEventsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records every accepted (signature-valid) webhook delivery, correlated
    /// or not. This is the audit trail the Reconciler and operators use to
    /// tell an orphan delivery (analysis server answered before the
    /// submission id was persisted) from a delivery that never arrived.
    pub async fn record(
        &self,
        analysis_id: &str,
        status: &str,
        component_key: Option<&str>,
        scan_job_id: Option<Uuid>,
        raw_payload: Value,
    ) -> anyhow::Result<Uuid> {
        let correlated = scan_job_id.is_some();
        let rec = sqlx::query!(
            r#"
            INSERT INTO webhook_events (analysis_id, status, component_key, scan_job_id, correlated, raw_payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
            analysis_id,
            status,
            component_key,
            scan_job_id,
            correlated,
            raw_payload,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(rec.id)
    }

    pub async fn find_by_analysis_id(
        &self,
        analysis_id: &str,
    ) -> anyhow::Result<Vec<WebhookEventRow>> {
        let rows = sqlx::query_as!(
            WebhookEventRow,
            r#"
            SELECT id, analysis_id, status, component_key, scan_job_id, correlated, raw_payload, received_at
            FROM webhook_events
            WHERE analysis_id = $1
            ORDER BY received_at ASC
            "#,
            analysis_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_orphans(&self) -> anyhow::Result<Vec<WebhookEventRow>> {
        let rows = sqlx::query_as!(
            WebhookEventRow,
            r#"
            SELECT id, analysis_id, status, component_key, scan_job_id, correlated, raw_payload, received_at
            FROM webhook_events
            WHERE correlated = false
            ORDER BY received_at ASC
            "#
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_correlated(&self, id: Uuid, scan_job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE webhook_events SET correlated = true, scan_job_id = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(scan_job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEventRow {
    pub id: Uuid,
    pub analysis_id: String,
    pub status: String,
    pub component_key: Option<String>,
    pub scan_job_id: Option<Uuid>,
    pub correlated: bool,
    pub raw_payload: Value,
    pub received_at: chrono::DateTime<chrono::Utc>,
}
