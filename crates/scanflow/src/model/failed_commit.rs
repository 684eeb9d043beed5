use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedCommit {
    pub id: Uuid,
    pub scan_job_id: Uuid,
    pub last_error_class: String,
    pub last_error: String,
    pub scanner_log_path: Option<String>,
    pub disposition: String,
    pub operator_config_override: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub enum Disposition {
    Pending,
    Queued,
    Resolved,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Pending => "pending",
            Disposition::Queued => "queued",
            Disposition::Resolved => "resolved",
        }
    }
}
