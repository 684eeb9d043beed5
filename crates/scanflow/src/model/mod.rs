pub mod failed_commit;
pub mod instance_lock;
pub mod project;
pub mod scan_job;
pub mod scan_result;

pub use failed_commit::{Disposition, FailedCommit};
pub use instance_lock::InstanceLock;
pub use project::{Project, ProjectStatus};
pub use scan_job::{Lease, NewScanJob, ScanJob, ScanJobState};
pub use scan_result::ScanResult;
