// Central runtime configuration.
//
// Scalars load from the environment; the instance pool and metric key
// list are richer structures so they load from an optional TOML file
// (SCANFLOW_CONFIG_PATH) layered on top.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::ScanError;

#[derive(Clone, Debug, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub host: String,
    pub token: String,
    pub concurrency_cap: i32,
    pub scanner_path: String,
}

#[derive(Clone, Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    instances: Vec<InstanceConfig>,
    #[serde(default)]
    metrics: Vec<String>,
    #[serde(default)]
    default_scan_config: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub worker_id: String,

    pub instances: Vec<InstanceConfig>,
    pub metrics: Vec<String>,
    pub default_scan_config: Option<Value>,
    pub metrics_chunk_size: usize,
    pub metrics_http_timeout_ms: u64,
    pub metrics_retry_max: u32,

    pub lease_ttl_seconds: i64,
    pub reconciler_interval_seconds: u64,
    pub wait_for_webhook_timeout_seconds: u64,
    pub scan_timeout_seconds: u64,
    pub stale_queue_threshold_seconds: i64,

    pub max_retries: i32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
    pub retry_jitter_ratio: f64,
    pub no_slot_requeue_delay_ms: u64,

    pub csv_encoding: String,
    pub ingestion_chunk_size: usize,

    pub webhook_secret: String,
    pub webhook_signature_headers: Vec<String>,

    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub repo_cache_dir: String,
    pub vcs_clone_url_template: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let redis_url =
            env_or_default("SCANFLOW_REDIS_URL", "redis://127.0.0.1:6379/0".to_string());

        let worker_id = env_or_fallback("SCANFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let file_cfg = load_file_config()?;

        Ok(Self {
            database_url,
            redis_url,
            worker_id,

            instances: file_cfg.instances,
            metrics: file_cfg.metrics,
            default_scan_config: file_cfg.default_scan_config,
            metrics_chunk_size: env_parse("SCANFLOW_METRICS_CHUNK_SIZE", 20),
            metrics_http_timeout_ms: env_parse("SCANFLOW_METRICS_HTTP_TIMEOUT_MS", 10_000),
            metrics_retry_max: env_parse("SCANFLOW_METRICS_RETRY_MAX", 5),

            lease_ttl_seconds: env_parse("SCANFLOW_LEASE_TTL_SECONDS", 120),
            reconciler_interval_seconds: env_parse("SCANFLOW_RECONCILER_INTERVAL_SECONDS", 30),
            wait_for_webhook_timeout_seconds: env_parse(
                "SCANFLOW_WAIT_FOR_WEBHOOK_TIMEOUT_SECONDS",
                1800,
            ),
            scan_timeout_seconds: env_parse("SCANFLOW_SCAN_TIMEOUT_SECONDS", 600),
            stale_queue_threshold_seconds: env_parse(
                "SCANFLOW_STALE_QUEUE_THRESHOLD_SECONDS",
                600,
            ),

            max_retries: env_parse("SCANFLOW_MAX_RETRIES", 3),
            retry_backoff_base_ms: env_parse("SCANFLOW_RETRY_BACKOFF_BASE_MS", 2_000),
            retry_backoff_cap_ms: env_parse("SCANFLOW_RETRY_BACKOFF_CAP_MS", 900_000),
            retry_jitter_ratio: env_parse("SCANFLOW_RETRY_JITTER_RATIO", 0.2),
            no_slot_requeue_delay_ms: env_parse("SCANFLOW_NO_SLOT_REQUEUE_DELAY_MS", 3_000),

            csv_encoding: env_or_default("SCANFLOW_CSV_ENCODING", "utf-8".to_string()),
            ingestion_chunk_size: env_parse("SCANFLOW_INGESTION_CHUNK_SIZE", 500),

            webhook_secret: std::env::var("SCANFLOW_WEBHOOK_SECRET").unwrap_or_default(),
            webhook_signature_headers: env_list(
                "SCANFLOW_WEBHOOK_SIGNATURE_HEADERS",
                &["X-Hub-Signature-256", "X-Scan-Signature"],
            ),

            admin_addr: env_or_fallback("SCANFLOW_ADMIN_ADDR", "ADMIN_ADDR")
                .and_then(|s| normalize_optional_addr(&s)),
            migrate_on_startup: env_bool("SCANFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
            repo_cache_dir: env_or_default("SCANFLOW_REPO_CACHE_DIR", "./repo-cache".to_string()),
            vcs_clone_url_template: env_or_default(
                "SCANFLOW_VCS_CLONE_URL_TEMPLATE",
                "https://github.com/{slug}.git".to_string(),
            ),
        })
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds.max(0) as u64)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_seconds)
    }

    pub fn wait_for_webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_webhook_timeout_seconds)
    }

    /// Job-level override wins, then project-level, then the system
    /// default; the first of the three that's present is used whole (no
    /// merging). `Value::Null` at any level is treated as "not set" rather
    /// than as an explicit empty config, since CSV/JSONB round-tripping
    /// produces JSON null for absent columns. An explicitly empty object
    /// or a non-object value is malformed: the analysis CLI expects a
    /// config blob it can parse, not an empty shell.
    pub fn resolve_scan_config(
        &self,
        job_override: Option<&Value>,
        project_override: Option<&Value>,
    ) -> Result<Option<Value>, ScanError> {
        let chosen = [job_override, project_override, self.default_scan_config.as_ref()]
            .into_iter()
            .flatten()
            .find(|v| !v.is_null());

        match chosen {
            None => Ok(None),
            Some(v) if v.is_object() && !v.as_object().unwrap().is_empty() => Ok(Some(v.clone())),
            Some(v) => Err(ScanError::MalformedConfig(format!(
                "configuration override must be a non-empty JSON object, got: {v}"
            ))),
        }
    }
}

fn load_file_config() -> anyhow::Result<FileConfig> {
    match std::env::var("SCANFLOW_CONFIG_PATH") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))?;
            let cfg: FileConfig = toml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("failed to parse {path}: {e}"))?;
            Ok(cfg)
        }
        Err(_) => Ok(FileConfig::default()),
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_or_default(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(default_scan_config: Option<Value>) -> Config {
        Config {
            database_url: String::new(),
            redis_url: String::new(),
            worker_id: String::new(),
            instances: vec![],
            metrics: vec![],
            default_scan_config,
            metrics_chunk_size: 20,
            metrics_http_timeout_ms: 1000,
            metrics_retry_max: 1,
            lease_ttl_seconds: 1,
            reconciler_interval_seconds: 1,
            wait_for_webhook_timeout_seconds: 1,
            scan_timeout_seconds: 1,
            stale_queue_threshold_seconds: 1,
            max_retries: 1,
            retry_backoff_base_ms: 1,
            retry_backoff_cap_ms: 1,
            retry_jitter_ratio: 0.0,
            no_slot_requeue_delay_ms: 1,
            csv_encoding: "utf-8".into(),
            ingestion_chunk_size: 1,
            webhook_secret: String::new(),
            webhook_signature_headers: vec![],
            admin_addr: None,
            migrate_on_startup: false,
            repo_cache_dir: String::new(),
            vcs_clone_url_template: String::new(),
        }
    }

    #[test]
    fn job_override_wins_over_project_and_system_default() {
        let c = cfg(Some(json!({"a": "system"})));
        let resolved = c
            .resolve_scan_config(Some(&json!({"a": "job"})), Some(&json!({"a": "project"})))
            .unwrap();
        assert_eq!(resolved, Some(json!({"a": "job"})));
    }

    #[test]
    fn project_override_wins_when_job_level_is_absent() {
        let c = cfg(Some(json!({"a": "system"})));
        let resolved = c.resolve_scan_config(None, Some(&json!({"a": "project"}))).unwrap();
        assert_eq!(resolved, Some(json!({"a": "project"})));
    }

    #[test]
    fn falls_back_to_system_default_when_nothing_else_is_set() {
        let c = cfg(Some(json!({"a": "system"})));
        assert_eq!(c.resolve_scan_config(None, None).unwrap(), Some(json!({"a": "system"})));
    }

    #[test]
    fn json_null_at_any_level_is_treated_as_unset() {
        let c = cfg(Some(json!({"a": "system"})));
        let resolved = c.resolve_scan_config(Some(&Value::Null), Some(&Value::Null)).unwrap();
        assert_eq!(resolved, Some(json!({"a": "system"})));
    }

    #[test]
    fn no_override_anywhere_resolves_to_none() {
        let c = cfg(None);
        assert_eq!(c.resolve_scan_config(None, None).unwrap(), None);
    }

    #[test]
    fn empty_object_override_is_malformed() {
        let c = cfg(None);
        let err = c.resolve_scan_config(Some(&json!({})), None).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_CONFIG");
    }

    #[test]
    fn non_object_override_is_malformed() {
        let c = cfg(None);
        let err = c.resolve_scan_config(Some(&json!("not an object")), None).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_CONFIG");
    }
}
