//! Downstream sink client.
//!
//! The [`Sink`] trait is the worker's only view of the downstream: hand it an
//! envelope, get back a [`DeliveryResult`]. It never returns an error and
//! never panics, so the worker only has to branch on success.
//!
//! [`HecSink`] delivers to a Splunk HTTP Event Collector. Each envelope is
//! rewritten into the HEC event schema:
//!
//! ```json
//! {
//!   "event": { ...original payload... },
//!   "time": 1760774400,
//!   "host": "hec-relay",
//!   "source": "webhook",
//!   "sourcetype": "_json",
//!   "fields": { "webhookId": "w1", "apiKey": "k1" }
//! }
//! ```
//!
//! and POSTed to `<base>/services/collector/event` with an
//! `Authorization: Splunk <token>` header.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::envelope::QueuedEnvelope;

/// Path of the HEC JSON event endpoint.
pub const COLLECTOR_PATH: &str = "/services/collector/event";

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connect timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest response body kept for diagnostics
const MAX_ERROR_BODY: usize = 1024;

/// Why a delivery attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The sink answered with a 4xx/5xx status
    #[error("sink returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The request timed out
    #[error("request timed out")]
    Timeout,

    /// Connection refused, DNS or TLS failure
    #[error("network error: {0}")]
    Network(String),

    /// Anything else
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SinkError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Status { status, .. } => *status >= 500,
            SinkError::Timeout | SinkError::Network(_) => true,
            SinkError::Unexpected(_) => false,
        }
    }
}

/// Outcome of [`Sink::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    Failed(SinkError),
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryResult::Delivered)
    }
}

/// A downstream destination for queued envelopes.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one envelope. All failures are reported in the result.
    async fn deliver(&self, envelope: &QueuedEnvelope) -> DeliveryResult;
}

/// Static labels attached to every HEC event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLabels {
    pub host: String,
    pub source: String,
    pub sourcetype: String,
}

impl Default for EventLabels {
    fn default() -> Self {
        Self {
            host: "hec-relay".to_string(),
            source: "webhook".to_string(),
            sourcetype: "_json".to_string(),
        }
    }
}

/// Resolve the collector endpoint from a configured base URL.
///
/// A URL that already names the event endpoint is used unchanged.
pub fn collector_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(COLLECTOR_PATH) {
        base.to_string()
    } else {
        format!("{}{}", base, COLLECTOR_PATH)
    }
}

/// Rewrite an envelope into the HEC event schema.
pub fn hec_event(envelope: &QueuedEnvelope, labels: &EventLabels) -> Value {
    json!({
        "event": envelope.original_payload,
        "time": envelope.received_at_unix_seconds,
        "host": labels.host,
        "source": labels.source,
        "sourcetype": labels.sourcetype,
        "fields": {
            "webhookId": envelope.webhook_id,
            "apiKey": envelope.api_key,
        },
    })
}

/// Splunk HTTP Event Collector client.
#[derive(Debug, Clone)]
pub struct HecSink {
    /// Full collector endpoint URL
    url: String,

    /// HEC token, sent as `Splunk <token>`
    token: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    labels: EventLabels,

    /// Extra attempts on 5xx / network failure
    retries: u32,
}

/// Builder for [`HecSink`].
#[derive(Debug, Clone)]
pub struct HecSinkBuilder {
    base_url: String,
    token: String,
    verify_tls: bool,
    timeout: Duration,
    connect_timeout: Duration,
    labels: EventLabels,
    retries: u32,
}

impl HecSinkBuilder {
    /// Skip certificate verification when `false`.
    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn labels(mut self, labels: EventLabels) -> Self {
        self.labels = labels;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn build(self) -> Result<HecSink, reqwest::Error> {
        if !self.verify_tls {
            warn!("TLS certificate verification is disabled for the sink");
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .danger_accept_invalid_certs(!self.verify_tls)
            .build()?;

        Ok(HecSink {
            url: collector_url(&self.base_url),
            token: self.token,
            client,
            labels: self.labels,
            retries: self.retries,
        })
    }
}

impl HecSink {
    pub fn builder(base_url: impl Into<String>, token: impl Into<String>) -> HecSinkBuilder {
        HecSinkBuilder {
            base_url: base_url.into(),
            token: token.into(),
            verify_tls: true,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            labels: EventLabels::default(),
            retries: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One POST to the collector.
    async fn send(&self, payload: &Value) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .header(AUTHORIZATION, format!("Splunk {}", self.token))
            .json(payload)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        truncate_at_char_boundary(&mut body, MAX_ERROR_BODY);
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Cut `body` to at most `max` bytes without splitting a UTF-8 character.
fn truncate_at_char_boundary(body: &mut String, max: usize) {
    if body.len() <= max {
        return;
    }
    let mut cut = max;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
}

/// Map a transport error onto the sink's failure kinds.
fn classify(err: reqwest::Error) -> SinkError {
    if err.is_timeout() {
        SinkError::Timeout
    } else if err.is_connect() || err.is_request() {
        SinkError::Network(err.to_string())
    } else {
        SinkError::Unexpected(err.to_string())
    }
}

#[async_trait]
impl Sink for HecSink {
    async fn deliver(&self, envelope: &QueuedEnvelope) -> DeliveryResult {
        let payload = hec_event(envelope, &self.labels);
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                debug!(
                    webhook_id = %envelope.webhook_id,
                    attempt = attempt,
                    max_retries = self.retries,
                    "Retrying sink delivery"
                );
            }

            match self.send(&payload).await {
                Ok(()) => {
                    info!(webhook_id = %envelope.webhook_id, "Forwarded webhook to sink");
                    return DeliveryResult::Delivered;
                }
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    warn!(
                        webhook_id = %envelope.webhook_id,
                        error = %e,
                        attempt = attempt,
                        "Sink delivery failed, will retry"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        webhook_id = %envelope.webhook_id,
                        url = %self.url,
                        error = %e,
                        "Sink delivery failed"
                    );
                    return DeliveryResult::Failed(e);
                }
            }
        }
    }
}
