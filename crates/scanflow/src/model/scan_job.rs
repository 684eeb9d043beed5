use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScanJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub repo_slug: String,
    pub commit_sha: String,
    pub branch: Option<String>,

    pub state: String,
    pub priority: String,
    pub attempts: i32,
    pub max_retries: i32,
    pub config_override: Option<Value>,

    pub lease_instance: Option<String>,
    pub lease_analysis_id: Option<String>,
    pub lease_acquired_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub scanner_log_path: Option<String>,
    pub last_error_class: Option<String>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    /// `{projectKey}_{commit}`, the string the analysis server addresses this
    /// scan by. `projectKey` is the repository slug with path separators
    /// flattened, since the server's component namespace is flat.
    pub fn component_key(&self) -> String {
        format!("{}_{}", self.repo_slug.replace('/', "_"), self.commit_sha)
    }

    pub fn lease(&self) -> Option<Lease> {
        Some(Lease {
            instance: self.lease_instance.clone()?,
            analysis_id: self.lease_analysis_id.clone(),
            acquired_at: self.lease_acquired_at?,
            expires_at: self.lease_expires_at?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub instance: String,
    pub analysis_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewScanJob {
    pub project_id: Uuid,
    pub repo_slug: String,
    pub commit_sha: String,
    pub branch: Option<String>,
    pub priority: String,
    pub max_retries: i32,
    pub config_override: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanJobState {
    Pending,
    Queued,
    Running,
    Succeeded,
    FailedTemp,
    FailedPermanent,
}

impl ScanJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanJobState::Pending => "pending",
            ScanJobState::Queued => "queued",
            ScanJobState::Running => "running",
            ScanJobState::Succeeded => "succeeded",
            ScanJobState::FailedTemp => "failed_temp",
            ScanJobState::FailedPermanent => "failed_permanent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ScanJobState::Pending,
            "queued" => ScanJobState::Queued,
            "running" => ScanJobState::Running,
            "succeeded" => ScanJobState::Succeeded,
            "failed_temp" => ScanJobState::FailedTemp,
            "failed_permanent" => ScanJobState::FailedPermanent,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanJobState::Succeeded | ScanJobState::FailedPermanent)
    }
}
