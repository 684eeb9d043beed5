use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{ScanJobsRepo, WebhookEventsRepo};
use crate::webhook::signature::verify_signature;

/// One job's wait-for-webhook slot: the `Notify` the Dispatcher blocks on,
/// plus the completion status the webhook handler stashes before waking
/// it. A bare `Notify` can't carry a payload, so the status lives beside
/// it in the same `Mutex` and the Dispatcher reads it back after waking:
/// only a SUCCESS status triggers a metrics fetch, anything else is
/// treated as a retryable analysis failure.
struct PendingCompletion {
    notify: Arc<Notify>,
    status: Mutex<Option<String>>,
}

/// Registry of per-job completion signals. The Dispatcher registers a
/// slot before it starts waiting on a submitted job and the webhook
/// handler fills in the status and fires it once the matching delivery
/// lands, so the Dispatcher doesn't have to poll the Store for a state
/// change.
#[derive(Clone, Default)]
pub struct Notifiers(Arc<Mutex<HashMap<Uuid, Arc<PendingCompletion>>>>);

pub struct CompletionWaiter {
    slot: Arc<PendingCompletion>,
}

impl CompletionWaiter {
    pub async fn wait(&self) {
        self.slot.notify.notified().await;
    }

    /// The status the webhook handler recorded, if the wait resolved
    /// because a delivery landed rather than because of a timeout.
    pub async fn status(&self) -> Option<String> {
        self.slot.status.lock().await.clone()
    }
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, scan_job_id: Uuid) -> CompletionWaiter {
        let mut guard = self.0.lock().await;
        let slot = guard
            .entry(scan_job_id)
            .or_insert_with(|| {
                Arc::new(PendingCompletion {
                    notify: Arc::new(Notify::new()),
                    status: Mutex::new(None),
                })
            })
            .clone();
        CompletionWaiter { slot }
    }

    pub async fn fire(&self, scan_job_id: Uuid, status: &str) {
        let mut guard = self.0.lock().await;
        if let Some(slot) = guard.remove(&scan_job_id) {
            *slot.status.lock().await = Some(status.to_string());
            slot.notify.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub scan_jobs: ScanJobsRepo,
    pub webhook_events: WebhookEventsRepo,
    pub secret: String,
    pub signature_headers: Vec<String>,
    pub notifiers: Notifiers,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/analysis", post(handle_webhook))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    analysis_id: String,
    status: String,
    component_key: Option<String>,
}

/// Verifies the signature, correlates the delivery to a RUNNING ScanJob by
/// its leased analysis id, and fires that job's completion signal. A
/// delivery that arrives before the submission id is persisted (the
/// analysis server replied faster than the scanner invocation committed its
/// write) or after the lease already expired is recorded as an orphan; the
/// Reconciler resolves those on its next sweep rather than the handler
/// retrying the correlation itself.
async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let signature = state
        .signature_headers
        .iter()
        .find_map(|name| headers.get(name))
        .and_then(|v| v.to_str().ok());

    let Some(signature) = signature else {
        warn!("webhook rejected: no signature header present");
        return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
    };

    if !verify_signature(&state.secret, &body, signature) {
        warn!("webhook rejected: signature mismatch");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "webhook rejected: malformed payload");
            return (StatusCode::BAD_REQUEST, "malformed payload").into_response();
        }
    };

    let raw: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let job = match state.scan_jobs.find_running_by_analysis_id(&payload.analysis_id).await {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "webhook lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response();
        }
    };

    let scan_job_id = job.as_ref().map(|j| j.id);

    if let Err(e) = state
        .webhook_events
        .record(
            &payload.analysis_id,
            &payload.status,
            payload.component_key.as_deref(),
            scan_job_id,
            raw,
        )
        .await
    {
        warn!(error = %e, "failed to record webhook event");
    }

    match scan_job_id {
        Some(id) => {
            info!(scan_job_id = %id, status = %payload.status, "webhook correlated");
            state.notifiers.fire(id, &payload.status).await;
        }
        None => {
            info!(analysis_id = %payload.analysis_id, "webhook delivered with no matching running job; recorded as orphan");
        }
    }

    (StatusCode::OK, "accepted").into_response()
}
