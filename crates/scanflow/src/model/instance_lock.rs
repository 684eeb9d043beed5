use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceLock {
    pub instance_name: String,
    pub slot_index: i32,
    pub lease_token: Option<Uuid>,
    pub holder_job_id: Option<Uuid>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}
