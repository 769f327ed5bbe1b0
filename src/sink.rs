//! Verified event sink: the one HTTP surface this system owns — a
//! shared-secret-authenticated endpoint that fans a worker's verified
//! lead out to the per-channel queues plus the node-wide verified
//! journal, with an optional outbound webhook notification.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::{debug, warn};

use crate::atomic_io::append_jsonl;
use crate::channel::{Channel, ALL_CHANNELS};
use crate::metrics::Metrics;
use crate::model::{QueueRecord, VerifiedEvent};

const SECRET_HEADER: &str = "x-engyne-worker-secret";

pub struct SinkState {
    pub runtime_root: PathBuf,
    pub worker_secret: String,
    pub outbound_webhook_url: Option<String>,
    pub http: reqwest::Client,
    pub metrics: Metrics,
}

pub fn router(state: Arc<SinkState>) -> Router {
    Router::new()
        .route("/events/verified", post(post_verified_event))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn metrics(State(state): State<Arc<SinkState>>) -> impl IntoResponse {
    state.metrics.encode()
}

/// Constant-time byte comparison — the header check never short-circuits
/// on the first mismatched byte.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let a = provided.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<SinkState>>) -> impl IntoResponse {
    let probe = state.runtime_root.join(".readyz_probe");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            StatusCode::OK
        }
        Err(err) => {
            warn!(%err, "readyz probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn verified_queue_path(runtime_root: &std::path::Path) -> PathBuf {
    runtime_root.join("verified_queue.jsonl")
}

fn channel_queue_path(runtime_root: &std::path::Path, channel: Channel) -> PathBuf {
    runtime_root.join(format!("{}_queue.jsonl", channel.as_str()))
}

async fn post_verified_event(
    State(state): State<Arc<SinkState>>,
    headers: HeaderMap,
    Json(event): Json<VerifiedEvent>,
) -> impl IntoResponse {
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !secrets_match(provided, &state.worker_secret) {
        debug!(slot_id = %event.slot_id, "verified event rejected: bad secret");
        state.metrics.sink_events_rejected.inc();
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.metrics.sink_events_accepted.inc();

    let received_at = Utc::now();
    let verified_record = QueueRecord {
        kind: "verified".to_string(),
        slot_id: event.slot_id.clone(),
        lead_id: event.lead_id.clone(),
        observed_at: event.observed_at,
        received_at,
        payload: event.payload.clone(),
        channel: None,
    };
    if let Err(err) = append_jsonl(&verified_queue_path(&state.runtime_root), &verified_record) {
        warn!(%err, "failed to append verified journal");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    for channel in ALL_CHANNELS {
        let record = QueueRecord {
            kind: "verified".to_string(),
            slot_id: event.slot_id.clone(),
            lead_id: event.lead_id.clone(),
            observed_at: event.observed_at,
            received_at,
            payload: event.payload.clone(),
            channel: Some(channel.as_str().to_string()),
        };
        if let Err(err) = append_jsonl(&channel_queue_path(&state.runtime_root, channel), &record)
        {
            warn!(%err, channel = channel.as_str(), "failed to append channel queue");
        }
    }

    if let Some(url) = &state.outbound_webhook_url {
        let client = state.http.clone();
        let url = url.clone();
        let body = serde_json::json!({
            "slot_id": event.slot_id,
            "lead_id": event.lead_id,
        });
        tokio::spawn(async move {
            if let Err(err) = client.post(url).json(&body).send().await {
                debug!(%err, "outbound webhook notification failed");
            }
        });
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "accepted",
            "slot_id": event.slot_id,
            "lead_id": event.lead_id,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_match_requires_exact_equality() {
        assert!(secrets_match("abc123", "abc123"));
        assert!(!secrets_match("abc123", "abc124"));
        assert!(!secrets_match("abc12", "abc123"));
        assert!(!secrets_match("", "abc123"));
    }

    #[test]
    fn empty_secrets_match_each_other() {
        assert!(secrets_match("", ""));
    }
}
