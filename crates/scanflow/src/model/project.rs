use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub csv_artifact_path: String,
    pub config_override: Option<Value>,

    pub build_count: i64,
    pub commit_count: i64,
    pub unique_branch_count: i64,

    pub status: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub enum ProjectStatus {
    Created,
    Collecting,
    Done,
    Partial,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::Collecting => "collecting",
            ProjectStatus::Done => "done",
            ProjectStatus::Partial => "partial",
        }
    }
}
