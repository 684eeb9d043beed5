use serde::Deserialize;
use uuid::Uuid;

use crate::model::NewScanJob;
use crate::store::ScanJobsRepo;

#[derive(Debug, Deserialize)]
struct CsvRow {
    gh_project_name: String,
    git_trigger_commit: String,
    #[serde(default)]
    git_branch: String,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub rows_seen: usize,
    pub jobs_created: usize,
    pub jobs_already_present: usize,
    pub unique_branches: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    scan_jobs: ScanJobsRepo,
}

impl Ingestor {
    pub fn new(scan_jobs: ScanJobsRepo) -> Self {
        Self { scan_jobs }
    }

    /// Decodes `raw` with `encoding_label` (falling back permanently if the
    /// bytes aren't valid in that encoding), then enumerates one ScanJob per
    /// CSV row in chunks of `chunk_size`. Required columns are verified by
    /// serde's deserialization failing on the first row if they're absent.
    /// Re-ingesting an already-seen (project, commit) pair is a no-op: the
    /// unique constraint rejects the duplicate insert and we count it
    /// instead of creating a second ScanJob for the same commit.
    pub async fn ingest(
        &self,
        project_id: Uuid,
        raw: &[u8],
        encoding_label: &str,
        priority: &str,
        max_retries: i32,
        chunk_size: usize,
    ) -> anyhow::Result<IngestReport> {
        let text = decode(raw, encoding_label)?;

        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());

        let mut report = IngestReport::default();
        let mut branches = std::collections::HashSet::new();
        let mut batch = Vec::with_capacity(chunk_size);

        for result in reader.deserialize::<CsvRow>() {
            let row: CsvRow = result.map_err(|e| anyhow::anyhow!("malformed CSV row: {e}"))?;
            report.rows_seen += 1;

            if !row.git_branch.is_empty() {
                branches.insert(row.git_branch.clone());
            }

            batch.push(row);
            if batch.len() >= chunk_size {
                self.ingest_batch(project_id, std::mem::take(&mut batch), priority, max_retries, &mut report)
                    .await?;
            }
        }

        if !batch.is_empty() {
            self.ingest_batch(project_id, batch, priority, max_retries, &mut report).await?;
        }

        report.unique_branches = branches.len();
        Ok(report)
    }

    async fn ingest_batch(
        &self,
        project_id: Uuid,
        rows: Vec<CsvRow>,
        priority: &str,
        max_retries: i32,
        report: &mut IngestReport,
    ) -> anyhow::Result<()> {
        for row in rows {
            let branch = if row.git_branch.is_empty() { None } else { Some(row.git_branch) };

            if self
                .scan_jobs
                .get_by_project_commit(project_id, &row.git_trigger_commit)
                .await?
                .is_some()
            {
                report.jobs_already_present += 1;
                continue;
            }

            let result = self
                .scan_jobs
                .create(NewScanJob {
                    project_id,
                    repo_slug: row.gh_project_name,
                    commit_sha: row.git_trigger_commit,
                    branch,
                    priority: priority.to_string(),
                    max_retries,
                    config_override: None,
                })
                .await;

            match result {
                Ok(_) => report.jobs_created += 1,
                Err(e) if is_unique_violation(&e) => report.jobs_already_present += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn is_unique_violation(e: &anyhow::Error) -> bool {
    e.to_string().contains("scan_jobs_project_commit_uniq")
}

fn decode(raw: &[u8], encoding_label: &str) -> anyhow::Result<String> {
    if let Ok(s) = std::str::from_utf8(raw) {
        return Ok(s.to_string());
    }

    let encoding = encoding_rs::Encoding::for_label(encoding_label.as_bytes())
        .ok_or_else(|| anyhow::anyhow!("unknown fallback encoding: {encoding_label}"))?;

    let (decoded, _, had_errors) = encoding.decode(raw);
    if had_errors {
        return Err(anyhow::anyhow!(
            "CSV payload contains bytes invalid in both UTF-8 and {encoding_label}"
        ));
    }

    Ok(decoded.into_owned())
}
