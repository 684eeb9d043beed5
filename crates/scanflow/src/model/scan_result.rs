use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScanResult {
    pub id: Uuid,
    pub scan_job_id: Uuid,
    pub analysis_key: String,
    pub analysis_id: String,
    pub metrics: Value,
    pub fetched_at: DateTime<Utc>,
}
