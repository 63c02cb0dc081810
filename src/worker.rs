//! Forwarding worker.
//!
//! A single [`Forwarder`] owns the consume side of the queue. Each iteration
//! does a blocking pop, and for every envelope it gets:
//!
//! 1. parses it (malformed elements are logged and dropped),
//! 2. skips it if its webhook id is already in the processed set,
//! 3. delivers it to the [`Sink`],
//! 4. on success marks the id as processed, on failure logs it and drops it
//!    (or dead-letters it when enabled).
//!
//! The pop is destructive, so a failed envelope is never redelivered from the
//! main queue. Queue errors pause the loop for one second before the next pop;
//! nothing a single envelope does can stop the loop.
//!
//! Only one worker per queue is supported. Two workers could both see an id as
//! unprocessed when two envelopes with the same id are popped before either
//! delivery completes.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dlq::DeadLetterQueue;
use crate::envelope::QueuedEnvelope;
use crate::metrics::Metrics;
use crate::queue::{QueueError, WebhookQueue};
use crate::sink::{DeliveryResult, Sink, SinkError};

/// Pause after a failed iteration, so a dead store does not spin the loop.
pub const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Lifecycle of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopping,
}

/// What happened to one popped element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Delivered and marked as processed
    Forwarded,
    /// Id already processed within the window; not delivered
    Duplicate,
    /// The sink refused or could not be reached; dropped
    Failed(SinkError),
    /// Not a valid envelope; dropped
    Malformed,
}

/// Errors that interrupt processing of one element.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Convert the configured poll interval into a `BLPOP` timeout.
///
/// Floor division to whole seconds, never below one second.
pub fn poll_timeout_secs(poll_interval_ms: u64) -> u64 {
    (poll_interval_ms / 1000).max(1)
}

/// The background consumer that drains the queue into the sink.
pub struct Forwarder {
    queue: WebhookQueue,
    sink: Arc<dyn Sink>,
    poll_timeout_secs: u64,
    dead_letters: Option<DeadLetterQueue>,
    metrics: Arc<Metrics>,
}

impl Forwarder {
    pub fn new(queue: WebhookQueue, sink: Arc<dyn Sink>, poll_interval_ms: u64) -> Self {
        Self {
            queue,
            sink,
            poll_timeout_secs: poll_timeout_secs(poll_interval_ms),
            dead_letters: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Push failed envelopes onto the queue's dead-letter list.
    pub fn with_dead_letters(mut self) -> Self {
        self.dead_letters = Some(DeadLetterQueue::for_queue(&self.queue));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn poll_timeout(&self) -> u64 {
        self.poll_timeout_secs
    }

    /// Run until `token` is cancelled.
    ///
    /// The token is checked between iterations; an in-flight pop or delivery
    /// is allowed to finish.
    pub async fn run(self, token: CancellationToken) {
        let mut state = WorkerState::Running;
        let mut handled: u64 = 0;

        info!(
            queue = %self.queue.queue_name(),
            poll_timeout_secs = self.poll_timeout_secs,
            dead_letter = self.dead_letters.is_some(),
            "Forwarding worker started, waiting for messages"
        );

        while state == WorkerState::Running {
            if token.is_cancelled() {
                state = WorkerState::Stopping;
                continue;
            }

            match self.poll_once().await {
                Ok(Some(_)) => {
                    handled += 1;
                    if handled.is_multiple_of(100) {
                        info!(handled = handled, "Worker statistics");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Unexpected error in worker loop");
                    tokio::select! {
                        _ = token.cancelled() => state = WorkerState::Stopping,
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                    }
                }
            }
        }

        info!(handled = handled, "Forwarding worker stopped");
    }

    /// One blocking pop, processing the element if one arrived.
    pub async fn poll_once(&self) -> Result<Option<ProcessOutcome>, ProcessError> {
        match self.queue.dequeue(self.poll_timeout_secs).await? {
            Some(raw) => self.process(&raw).await.map(Some),
            None => Ok(None),
        }
    }

    /// Deduplicate, deliver and record one raw envelope.
    pub async fn process(&self, raw: &str) -> Result<ProcessOutcome, ProcessError> {
        let envelope = match QueuedEnvelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed queue element");
                debug!(raw = %raw, "Malformed element");
                return Ok(ProcessOutcome::Malformed);
            }
        };
        let webhook_id = envelope.webhook_id.as_str();

        if self.queue.is_webhook_processed(webhook_id).await? {
            info!(
                webhook_id = %webhook_id,
                "Skipping duplicate webhook (already processed within window)"
            );
            Metrics::incr(&self.metrics.duplicates);
            return Ok(ProcessOutcome::Duplicate);
        }

        info!(webhook_id = %webhook_id, "Processing webhook");

        match self.sink.deliver(&envelope).await {
            DeliveryResult::Delivered => {
                Metrics::incr(&self.metrics.forwarded);
                self.queue.mark_webhook_as_processed(webhook_id).await?;
                Ok(ProcessOutcome::Forwarded)
            }
            DeliveryResult::Failed(reason) => {
                Metrics::incr(&self.metrics.failed);
                error!(
                    webhook_id = %webhook_id,
                    error = %reason,
                    "Failed to forward webhook, dropping"
                );
                self.dead_letter(&envelope, &reason).await;
                Ok(ProcessOutcome::Failed(reason))
            }
        }
    }

    async fn dead_letter(&self, envelope: &QueuedEnvelope, reason: &SinkError) {
        let Some(dlq) = &self.dead_letters else {
            return;
        };

        match dlq.add_failed(envelope, &reason.to_string()).await {
            Ok(_) => Metrics::incr(&self.metrics.dead_lettered),
            Err(e) => error!(
                webhook_id = %envelope.webhook_id,
                error = %e,
                "Failed to dead-letter envelope"
            ),
        }
    }
}
