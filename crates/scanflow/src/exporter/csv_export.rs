use uuid::Uuid;

use crate::store::{ScanJobsRepo, ScanResultsRepo};

#[derive(Clone)]
pub struct Exporter {
    scan_jobs: ScanJobsRepo,
    scan_results: ScanResultsRepo,
}

impl Exporter {
    pub fn new(scan_jobs: ScanJobsRepo, scan_results: ScanResultsRepo) -> Self {
        Self {
            scan_jobs,
            scan_results,
        }
    }

    /// Streams every ScanResult for a project as CSV: one row per commit,
    /// metrics flattened to top-level JSON-string columns since each
    /// scanner's metric set varies by configuration.
    pub async fn export_project_csv(&self, project_id: Uuid) -> anyhow::Result<Vec<u8>> {
        let results = self.scan_results.list_for_project(project_id).await?;

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["repo_slug", "commit_sha", "analysis_id", "metrics_json"])?;

        for result in results {
            let job = self.scan_jobs.get(result.scan_job_id).await?;
            let (repo_slug, commit_sha) = match job {
                Some(j) => (j.repo_slug, j.commit_sha),
                None => (String::new(), String::new()),
            };

            writer.write_record([
                repo_slug.as_str(),
                commit_sha.as_str(),
                result.analysis_id.as_str(),
                &result.metrics.to_string(),
            ])?;
        }

        Ok(writer.into_inner()?)
    }
}
