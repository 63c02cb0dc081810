//! HTTP ingress.
//!
//! `POST /webhook` authenticates the raw body against `X-Signature`, wraps the
//! parsed JSON in a [`QueuedEnvelope`] and pushes it onto the queue. It only
//! answers `200 OK` once the push is confirmed. Repeated deliveries of the
//! same `X-Webhook-Id` are queued again; the worker deduplicates them.
//!
//! Header presence is checked before the signature, so a request missing
//! `X-Webhook-Id` or `X-Api-Key` gets 400 even when it is also unsigned.
//!
//! | Outcome                         | Status | Body                      |
//! |---------------------------------|--------|---------------------------|
//! | queued                          | 200    | `OK`                      |
//! | missing id / api key header     | 400    | `Missing <header> header` |
//! | body is not JSON                | 400    | `Malformed JSON payload`  |
//! | bad or missing signature        | 403    | `Invalid X-Signature`     |
//! | queue unavailable               | 500    | `Internal Server Error`   |

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::envelope::{InboundEvent, QueuedEnvelope};
use crate::metrics::Metrics;
use crate::queue::WebhookQueue;
use crate::signature;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-Id";
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Shared state for request handlers.
pub struct AppState {
    pub queue: WebhookQueue,
    pub shared_secret: String,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(queue: WebhookQueue, shared_secret: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            queue,
            shared_secret: shared_secret.into(),
            metrics,
        }
    }
}

/// Build the relay's HTTP routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/webhook", post(receive_webhook))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn reject(state: &AppState, status: StatusCode, body: &'static str) -> Response {
    Metrics::incr(&state.metrics.rejected);
    (status, body).into_response()
}

/// `POST /webhook`
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    Metrics::incr(&state.metrics.received);

    let Some(webhook_id) = header(&headers, WEBHOOK_ID_HEADER) else {
        warn!("Webhook rejected: missing X-Webhook-Id");
        return reject(&state, StatusCode::BAD_REQUEST, "Missing X-Webhook-Id header");
    };
    let Some(api_key) = header(&headers, API_KEY_HEADER) else {
        warn!(webhook_id = %webhook_id, "Webhook rejected: missing X-Api-Key");
        return reject(&state, StatusCode::BAD_REQUEST, "Missing X-Api-Key header");
    };

    let inbound = InboundEvent {
        body: &body[..],
        signature: header(&headers, SIGNATURE_HEADER).unwrap_or_default(),
        webhook_id,
        api_key,
    };

    info!(webhook_id = %inbound.webhook_id, "Received webhook, checking signature");

    if !signature::verify(inbound.body, inbound.signature, &state.shared_secret) {
        warn!(webhook_id = %inbound.webhook_id, "Invalid X-Signature, request rejected");
        return reject(&state, StatusCode::FORBIDDEN, "Invalid X-Signature");
    }

    let payload: Value = match serde_json::from_slice(inbound.body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(webhook_id = %inbound.webhook_id, error = %e, "Malformed JSON payload");
            return reject(&state, StatusCode::BAD_REQUEST, "Malformed JSON payload");
        }
    };

    let envelope = QueuedEnvelope::new(inbound.webhook_id, inbound.api_key, payload);

    match state.queue.enqueue(&envelope).await {
        Ok(length) => {
            Metrics::incr(&state.metrics.enqueued);
            debug!(webhook_id = %envelope.webhook_id, queue_length = length, "Webhook enqueued");
            (StatusCode::OK, "OK").into_response()
        }
        Err(e) => {
            error!(webhook_id = %envelope.webhook_id, error = %e, "Failed to enqueue webhook");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// `GET /health`: checks the queue store is reachable.
async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    state.queue.ping().await.map_err(|e| {
        error!(error = %e, "Queue health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(json!({ "status": "ok", "queue": "connected" })))
}

/// `GET /metrics`
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.snapshot())
}
