//! Integration tests for the `POST /webhook` ingestion endpoint.
//!
//! Requests go through the real axum router with an in-memory queue store.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use hec_relay::metrics::Metrics;
use hec_relay::queue::{InMemoryQueue, QueueError, QueueStore, WebhookQueue};
use hec_relay::server::{router, AppState};
use hec_relay::signature::sign;
use hec_relay::QueuedEnvelope;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "stream-api-secret";

fn app_with(store: Arc<dyn QueueStore>) -> (Router, WebhookQueue, Arc<Metrics>) {
    let queue = WebhookQueue::new(store, "webhook_queue", 3600);
    let metrics = Arc::new(Metrics::new());
    let state = Arc::new(AppState::new(queue.clone(), SECRET, metrics.clone()));
    (router(state), queue, metrics)
}

fn app() -> (Router, WebhookQueue, Arc<Metrics>) {
    app_with(Arc::new(InMemoryQueue::new()))
}

fn webhook_request(body: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-Signature", signature)
        .header("X-Webhook-Id", "w1")
        .header("X-Api-Key", "k1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn valid_signature_enqueues_envelope() {
    let (app, queue, metrics) = app();
    let body = r#"{"a":1}"#;
    let signature = sign(body.as_bytes(), SECRET).unwrap();

    let response = app.oneshot(webhook_request(body, &signature)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
    assert_eq!(queue.len().await.unwrap(), 1);

    let raw = queue.dequeue(1).await.unwrap().unwrap();
    let envelope = QueuedEnvelope::from_json(&raw).unwrap();
    assert_eq!(envelope.original_payload, json!({"a": 1}));
    assert_eq!(envelope.webhook_id, "w1");
    assert_eq!(envelope.api_key, "k1");
    assert!(envelope.received_at_unix_seconds > 0);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot["ingress"]["received"], 1);
    assert_eq!(snapshot["ingress"]["enqueued"], 1);
}

#[tokio::test]
async fn invalid_signature_is_forbidden_and_not_queued() {
    let (app, queue, metrics) = app();
    let body = r#"{"a":1}"#;
    let signature = sign(body.as_bytes(), "wrong-secret").unwrap();

    let response = app.oneshot(webhook_request(body, &signature)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_text(response).await, "Invalid X-Signature");
    assert_eq!(queue.len().await.unwrap(), 0);
    assert_eq!(metrics.snapshot()["ingress"]["rejected"], 1);
}

#[tokio::test]
async fn missing_signature_is_forbidden() {
    let (app, queue, _) = app();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-Webhook-Id", "w1")
        .header("X-Api-Key", "k1")
        .body(Body::from(r#"{"a":1}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn signature_over_different_body_is_forbidden() {
    let (app, queue, _) = app();
    let signature = sign(br#"{"a":2}"#, SECRET).unwrap();

    let response = app.oneshot(webhook_request(r#"{"a":1}"#, &signature)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_webhook_id_is_bad_request() {
    let (app, queue, _) = app();
    let body = r#"{"a":1}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-Signature", sign(body.as_bytes(), SECRET).unwrap())
        .header("X-Api-Key", "k1")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Missing X-Webhook-Id header");
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_headers_are_checked_before_signature() {
    let (app, queue, metrics) = app();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-Signature", "not-a-signature")
        .header("X-Webhook-Id", "w1")
        .body(Body::from(r#"{"a":1}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Missing X-Api-Key header");
    assert_eq!(queue.len().await.unwrap(), 0);
    assert_eq!(metrics.snapshot()["ingress"]["rejected"], 1);
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let (app, queue, _) = app();
    let body = "{not json";
    let signature = sign(body.as_bytes(), SECRET).unwrap();

    let response = app.oneshot(webhook_request(body, &signature)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Malformed JSON payload");
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_delivery_is_queued_twice() {
    let (app, queue, _) = app();
    let body = r#"{"a":1}"#;
    let signature = sign(body.as_bytes(), SECRET).unwrap();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(webhook_request(body, &signature))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(queue.len().await.unwrap(), 2);
}

/// A store whose every operation fails, standing in for an unreachable Redis.
struct UnavailableStore;

#[async_trait]
impl QueueStore for UnavailableStore {
    async fn push(&self, _key: &str, _value: &str) -> Result<u64, QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    async fn pop_blocking(&self, _key: &str, _timeout: u64) -> Result<Option<String>, QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    async fn len(&self, _key: &str) -> Result<u64, QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    async fn is_member(&self, _set_key: &str, _member: &str) -> Result<bool, QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    async fn add_member(&self, _set_key: &str, _member: &str) -> Result<(), QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    async fn set_expiry(&self, _set_key: &str, _seconds: u64) -> Result<(), QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    async fn trim(&self, _key: &str, _keep_last: u64) -> Result<(), QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Err(QueueError::Connection("connection refused".into()))
    }
}

#[tokio::test]
async fn queue_failure_is_internal_server_error() {
    let (app, _, _) = app_with(Arc::new(UnavailableStore));
    let body = r#"{"a":1}"#;
    let signature = sign(body.as_bytes(), SECRET).unwrap();

    let response = app.oneshot(webhook_request(body, &signature)).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Internal Server Error");
}

#[tokio::test]
async fn health_reports_queue_state() {
    let (app, _, _) = app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body, json!({"status": "ok", "queue": "connected"}));

    let (app, _, _) = app_with(Arc::new(UnavailableStore));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn metrics_endpoint_returns_counters() {
    let (app, _, metrics) = app();
    Metrics::incr(&metrics.forwarded);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["worker"]["forwarded"], 1);
    assert!(body["uptime_seconds"].is_u64());
}
