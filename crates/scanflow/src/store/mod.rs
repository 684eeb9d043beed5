pub mod failed_commits;
pub mod projects;
pub mod scan_jobs;
pub mod scan_results;
pub mod webhook_events;

pub use failed_commits::FailedCommitsRepo;
pub use projects::ProjectsRepo;
pub use scan_jobs::ScanJobsRepo;
pub use scan_results::ScanResultsRepo;
pub use webhook_events::WebhookEventsRepo;
