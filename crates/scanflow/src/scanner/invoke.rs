use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::ScanError;

/// What the scanner binary printed on success: the analysis server's
/// tracking id, parsed from the last line of stdout that looks like
/// `submission_id=<id>`. The scanner itself is opaque and shell-invoked;
/// this is the one piece of its output the Dispatcher needs to correlate
/// the eventual webhook back to this job.
pub struct ScanOutcome {
    pub submission_id: String,
    pub log_path: String,
}

#[derive(Clone)]
pub struct Scanner {
    pub binary_path: String,
}

impl Scanner {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Invokes the scanner against a checked-out worktree, tees stdout/stderr
    /// to `log_path`, and extracts the submission id the scanner reports.
    /// `NoSubmissionId` is reported as `ScanError::SubmissionIdMissing` (a
    /// protocol-violation-adjacent permanent failure: the scanner ran to
    /// completion but produced nothing we can correlate a webhook against).
    ///
    /// `project_key` is the resolved `{projectKey}_{commit}` component key;
    /// `config_override` is the already-resolved (job > project > system
    /// default) configuration blob, passed through as JSON since the
    /// scanner CLI is opaque and shell-invoked.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        worktree: &Path,
        project_key: &str,
        instance_host: &str,
        instance_token: &str,
        config_override: Option<&Value>,
        log_path: &str,
        timeout: Duration,
    ) -> Result<ScanOutcome, ScanError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--target").arg(worktree)
            .arg("--project-key").arg(project_key)
            .arg("--instance-host").arg(instance_host)
            .env("SCANFLOW_INSTANCE_TOKEN", instance_token)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(cfg) = config_override {
            cmd.env("SCANFLOW_CONFIG_OVERRIDE", cfg.to_string());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ScanError::CheckoutIo(format!("failed to spawn scanner: {e}")))?;

        let mut log_file = tokio::fs::File::create(log_path)
            .await
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let submission_id = std::sync::Arc::new(tokio::sync::Mutex::new(None::<String>));
        let sub_id_writer = submission_id.clone();

        let mut log_file_clone = log_file.try_clone().await.ok();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(id) = line.strip_prefix("submission_id=") {
                    *sub_id_writer.lock().await = Some(id.trim().to_string());
                }
                if let Some(f) = log_file_clone.as_mut() {
                    use tokio::io::AsyncWriteExt;
                    let _ = f.write_all(line.as_bytes()).await;
                    let _ = f.write_all(b"\n").await;
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                use tokio::io::AsyncWriteExt;
                let _ = log_file.write_all(format!("[stderr] {line}\n").as_bytes()).await;
            }
        });

        let status = tokio::time::timeout(timeout, child.wait())
            .await
            .map_err(|_| ScanError::ScanTimeout)?
            .map_err(|e| ScanError::CheckoutIo(e.to_string()))?;

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(ScanError::AnalysisFailed(format!(
                "scanner exited with status {status}"
            )));
        }

        let submission_id = submission_id
            .lock()
            .await
            .clone()
            .ok_or(ScanError::SubmissionIdMissing)?;

        Ok(ScanOutcome {
            submission_id,
            log_path: log_path.to_string(),
        })
    }
}
