//! Dead-letter list for envelopes the sink refused.
//!
//! Dead-lettering is off by default: the relay logs a failed delivery and
//! moves on. With `worker.dead_letter = true` the worker additionally pushes
//! each failed envelope, with the failure reason, onto
//! `dead_letter:<queue>` for manual inspection and replay.
//!
//! The list is capped at [`DEAD_LETTER_MAX_LEN`] entries; the oldest letters
//! are trimmed first.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::envelope::QueuedEnvelope;
use crate::queue::{QueueError, QueueStore, WebhookQueue};

/// Maximum entries kept in a dead-letter list.
pub const DEAD_LETTER_MAX_LEN: u64 = 10_000;

/// A failed envelope stored in the dead-letter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The envelope exactly as it was popped
    pub envelope: QueuedEnvelope,

    /// Failure reason from the last attempt
    pub error: String,

    /// RFC 3339 time the envelope was dead-lettered
    pub failed_at: String,
}

/// Errors that can occur when writing to the dead-letter list.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("dead-letter store error: {0}")]
    Store(#[from] QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Writer for one queue's dead-letter list.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn QueueStore>,
    key: String,
    max_len: u64,
}

impl DeadLetterQueue {
    /// Dead-letter list belonging to `queue`.
    pub fn for_queue(queue: &WebhookQueue) -> Self {
        Self {
            store: queue.store().clone(),
            key: queue.dead_letter_key().to_string(),
            max_len: DEAD_LETTER_MAX_LEN,
        }
    }

    /// Override the entry cap.
    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a failed envelope, trimming the oldest letters past the cap.
    /// Returns the list length after trimming.
    pub async fn add_failed(&self, envelope: &QueuedEnvelope, error: &str) -> Result<u64, DlqError> {
        let letter = DeadLetter {
            envelope: envelope.clone(),
            error: error.to_string(),
            failed_at: chrono::Utc::now().to_rfc3339(),
        };

        let mut length = self.store.push(&self.key, &serde_json::to_string(&letter)?).await?;
        if length > self.max_len {
            self.store.trim(&self.key, self.max_len).await?;
            debug!(trimmed = length - self.max_len, "Dead-letter list trimmed");
            length = self.max_len;
        }

        info!(
            webhook_id = %envelope.webhook_id,
            dlq_length = length,
            "Envelope moved to dead-letter list"
        );

        Ok(length)
    }

    pub async fn count(&self) -> Result<u64, DlqError> {
        Ok(self.store.len(&self.key).await?)
    }
}
