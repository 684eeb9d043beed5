use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ScanError, ScanErrorClass};

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    component: ComponentMeasures,
}

#[derive(Debug, Deserialize)]
struct ComponentMeasures {
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
struct Measure {
    metric: String,
    value: Value,
}

/// Pulls metrics for a finished analysis from the instance's read API in
/// chunks of `chunk_size` metric keys at a time, the way `cyclotron-fetch`
/// batches outbound HTTP work rather than issuing one request per key.
#[derive(Clone)]
pub struct MetricsFetcher {
    client: reqwest::Client,
    chunk_size: usize,
    retry_max: u32,
}

impl MetricsFetcher {
    pub fn new(timeout: Duration, chunk_size: usize, retry_max: u32) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            chunk_size: chunk_size.max(1),
            retry_max,
        })
    }

    /// Fetches every requested metric key for `component`, merging chunked
    /// responses into a single metric-name -> value map. A 404 on a chunk
    /// means the component isn't indexed yet and is retried up to
    /// `retry_max` times with linear backoff; a 5xx status or a timeout is
    /// retried the same number of times but with exponential backoff, per
    /// §4.7's "retry with exponential backoff up to M times"; any other
    /// non-2xx status (`ScanErrorClass::Permanent`) is not retried here.
    pub async fn fetch(
        &self,
        instance_host: &str,
        instance_token: &str,
        component: &str,
        metric_keys: &[String],
    ) -> Result<Value, ScanError> {
        let mut merged = Map::new();

        for chunk in metric_keys.chunks(self.chunk_size) {
            let measures = self
                .fetch_chunk_with_retry(instance_host, instance_token, component, chunk)
                .await?;
            for m in measures {
                merged.insert(m.metric, m.value);
            }
        }

        Ok(Value::Object(merged))
    }

    async fn fetch_chunk_with_retry(
        &self,
        instance_host: &str,
        instance_token: &str,
        component: &str,
        keys: &[String],
    ) -> Result<Vec<Measure>, ScanError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_chunk(instance_host, instance_token, component, keys).await {
                Ok(v) => return Ok(v),
                Err(ScanError::MetricsHttpStatus(404)) if attempt < self.retry_max => {
                    warn!(component, attempt, "metrics component not yet indexed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e @ ScanError::MetricsHttpStatus(_)) | Err(e @ ScanError::MetricsTimeout)
                    if e.class() == ScanErrorClass::Retryable && attempt < self.retry_max =>
                {
                    let delay_ms = 200_u64.saturating_mul(1 << (attempt - 1).min(16));
                    warn!(component, attempt, error = %e, "metrics fetch failed transiently, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_chunk(
        &self,
        instance_host: &str,
        instance_token: &str,
        component: &str,
        keys: &[String],
    ) -> Result<Vec<Measure>, ScanError> {
        let url = format!("{instance_host}/api/measures/component");

        let resp = self
            .client
            .get(&url)
            .bearer_auth(instance_token)
            .query(&[("component", component), ("metricKeys", &keys.join(","))])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScanError::MetricsTimeout
                } else {
                    ScanError::Other(e.into())
                }
            })?;

        if !resp.status().is_success() {
            return Err(ScanError::MetricsHttpStatus(resp.status().as_u16()));
        }

        let parsed: MetricsResponse = resp.json().await.map_err(|e| ScanError::Other(e.into()))?;
        Ok(parsed.component.measures)
    }
}
