//! Queued event types.
//!
//! The [`QueuedEnvelope`] is what the relay persists for every accepted
//! webhook: the original JSON body plus the metadata the ingestion endpoint
//! stamped on it. Envelopes are serialized as JSON documents, pushed onto the
//! tail of the queue and popped by the forwarding worker.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A webhook as received over HTTP, before it is queued.
///
/// Only lives for the duration of one request.
#[derive(Debug, Clone)]
pub struct InboundEvent<'a> {
    /// Raw request body, expected to be JSON
    pub body: &'a [u8],

    /// Value of the `X-Signature` header
    pub signature: &'a str,

    /// Value of the `X-Webhook-Id` header
    pub webhook_id: &'a str,

    /// Value of the `X-Api-Key` header
    pub api_key: &'a str,
}

/// The persisted, metadata-wrapped form of an inbound event.
///
/// # Example
///
/// ```json
/// {
///   "receivedAtUnixSeconds": 1760774400,
///   "webhookId": "w1",
///   "apiKey": "k1",
///   "originalPayload": {"type": "message.new"}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEnvelope {
    /// Unix time (seconds) at which the relay accepted the event
    pub received_at_unix_seconds: i64,

    /// Caller-assigned event identifier, used for deduplication
    pub webhook_id: String,

    /// Caller-supplied API key label
    pub api_key: String,

    /// The parsed request body
    pub original_payload: Value,
}

impl QueuedEnvelope {
    /// Wrap a parsed payload, stamping it with the current time.
    pub fn new(webhook_id: impl Into<String>, api_key: impl Into<String>, payload: Value) -> Self {
        Self::received_at(Utc::now().timestamp(), webhook_id, api_key, payload)
    }

    /// Wrap a parsed payload with an explicit receipt time.
    pub fn received_at(
        received_at_unix_seconds: i64,
        webhook_id: impl Into<String>,
        api_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            received_at_unix_seconds,
            webhook_id: webhook_id.into(),
            api_key: api_key.into(),
            original_payload: payload,
        }
    }

    /// Serialize for the queue.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an element popped from the queue.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
