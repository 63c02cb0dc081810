//! Durable queue adapter.
//!
//! The relay needs two things from its store: a FIFO list with a blocking,
//! destructive pop, and a set whose expiry can be refreshed. [`QueueStore`]
//! names exactly those primitives; [`RedisQueue`] implements them with
//! `RPUSH`/`BLPOP`/`LTRIM`/`SISMEMBER`/`SADD`/`EXPIRE`, and [`InMemoryQueue`] provides
//! the same semantics in-process for tests and local runs.
//!
//! [`WebhookQueue`] layers the relay's vocabulary on top: one named queue, its
//! `processed_webhooks:<queue>` deduplication set, and the dedup window.
//!
//! # Deduplication window
//!
//! The TTL lives on the whole set, not on each member. Every call to
//! [`WebhookQueue::mark_webhook_as_processed`] resets the set's expiry to the
//! full window, so adding any marker extends the life of every marker already
//! in the set.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::envelope::QueuedEnvelope;

/// Prefix of the deduplication set key.
pub const PROCESSED_SET_PREFIX: &str = "processed_webhooks";

/// Prefix of the dead-letter list key.
pub const DEAD_LETTER_PREFIX: &str = "dead_letter";

/// Errors raised by the queue store.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(#[from] deadpool_redis::redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage primitives behind the relay queue.
///
/// Implementations must be safe for concurrent `push` from many request
/// handlers while a single consumer pops.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append `value` to the tail of list `key`. Returns the new length.
    async fn push(&self, key: &str, value: &str) -> Result<u64, QueueError>;

    /// Remove and return the head of list `key`, waiting up to
    /// `timeout_secs` for one to arrive. `0` waits indefinitely.
    ///
    /// Returns `Ok(None)` when the timeout elapses with no data.
    async fn pop_blocking(&self, key: &str, timeout_secs: u64) -> Result<Option<String>, QueueError>;

    /// Current length of list `key`.
    async fn len(&self, key: &str) -> Result<u64, QueueError>;

    /// Keep only the newest `keep_last` elements of list `key`.
    async fn trim(&self, key: &str, keep_last: u64) -> Result<(), QueueError>;

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, QueueError>;

    async fn add_member(&self, set_key: &str, member: &str) -> Result<(), QueueError>;

    /// Reset the TTL of the whole set to `seconds`.
    async fn set_expiry(&self, set_key: &str, seconds: u64) -> Result<(), QueueError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Redis-backed [`QueueStore`].
#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
}

impl RedisQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

#[async_trait]
impl QueueStore for RedisQueue {
    async fn push(&self, key: &str, value: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let length: u64 = cmd("RPUSH").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(length)
    }

    async fn pop_blocking(&self, key: &str, timeout_secs: u64) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection().await?;

        // BLPOP replies with (key, value) or nil on timeout
        let popped: Option<(String, String)> = cmd("BLPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(popped.map(|(_, value)| value))
    }

    async fn len(&self, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let length: u64 = cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(length)
    }

    async fn trim(&self, key: &str, keep_last: u64) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        if keep_last == 0 {
            let _: u64 = cmd("DEL").arg(key).query_async(&mut conn).await?;
            return Ok(());
        }
        // Negative indices count from the tail, so this keeps the newest entries
        let start = -(keep_last as i64);
        let _: () = cmd("LTRIM").arg(key).arg(start).arg(-1).query_async(&mut conn).await?;
        Ok(())
    }

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let found: bool = cmd("SISMEMBER")
            .arg(set_key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }

    async fn add_member(&self, set_key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: u64 = cmd("SADD").arg(set_key).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_expiry(&self, set_key: &str, seconds: u64) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: bool = cmd("EXPIRE").arg(set_key).arg(seconds).query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: String = cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExpiringSet {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

impl ExpiringSet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, ExpiringSet>,
}

impl MemoryState {
    /// Drop the set if its TTL has passed, mirroring Redis key expiry.
    fn live_set(&mut self, key: &str) -> Option<&mut ExpiringSet> {
        let now = Instant::now();
        if self.sets.get(key).is_some_and(|set| set.is_expired(now)) {
            self.sets.remove(key);
        }
        self.sets.get_mut(key)
    }
}

/// In-process [`QueueStore`] with the same FIFO and set-TTL semantics as
/// Redis. Uses tokio time, so tests can pause and advance the clock.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<MemoryState>,
    pushed: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueue {
    async fn push(&self, key: &str, value: &str) -> Result<u64, QueueError> {
        let length = {
            let mut state = self.state.lock().await;
            let list = state.lists.entry(key.to_string()).or_default();
            list.push_back(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(length)
    }

    async fn pop_blocking(&self, key: &str, timeout_secs: u64) -> Result<Option<String>, QueueError> {
        let deadline = (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));

        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // wait is not missed
            notified.as_mut().enable();

            if let Some(value) = self
                .state
                .lock()
                .await
                .lists
                .get_mut(key)
                .and_then(|list| list.pop_front())
            {
                return Ok(Some(value));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn len(&self, key: &str) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn trim(&self, key: &str, keep_last: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(list) = state.lists.get_mut(key) {
            let excess = list.len().saturating_sub(keep_last as usize);
            list.drain(..excess);
        }
        Ok(())
    }

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state
            .live_set(set_key)
            .is_some_and(|set| set.members.contains(member)))
    }

    async fn add_member(&self, set_key: &str, member: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.live_set(set_key).is_none() {
            state.sets.insert(set_key.to_string(), ExpiringSet::default());
        }
        if let Some(set) = state.sets.get_mut(set_key) {
            set.members.insert(member.to_string());
        }
        Ok(())
    }

    async fn set_expiry(&self, set_key: &str, seconds: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        // EXPIRE on a missing key is a no-op
        if let Some(set) = state.live_set(set_key) {
            set.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// One named webhook queue plus its deduplication set.
#[derive(Clone)]
pub struct WebhookQueue {
    store: Arc<dyn QueueStore>,
    queue_name: String,
    processed_set_key: String,
    dead_letter_key: String,
    deduplication_window_seconds: u64,
}

impl WebhookQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        queue_name: impl Into<String>,
        deduplication_window_seconds: u64,
    ) -> Self {
        let queue_name = queue_name.into();
        Self {
            store,
            processed_set_key: format!("{}:{}", PROCESSED_SET_PREFIX, queue_name),
            dead_letter_key: format!("{}:{}", DEAD_LETTER_PREFIX, queue_name),
            queue_name,
            deduplication_window_seconds,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn processed_set_key(&self) -> &str {
        &self.processed_set_key
    }

    pub fn dead_letter_key(&self) -> &str {
        &self.dead_letter_key
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Serialize and append an envelope. Returns the new queue length.
    pub async fn enqueue(&self, envelope: &QueuedEnvelope) -> Result<u64, QueueError> {
        let json = envelope.to_json()?;
        let length = self.store.push(&self.queue_name, &json).await?;
        info!(
            webhook_id = %envelope.webhook_id,
            queue_length = length,
            "Webhook queued"
        );
        Ok(length)
    }

    /// Blocking pop of the oldest raw envelope.
    pub async fn dequeue(&self, timeout_secs: u64) -> Result<Option<String>, QueueError> {
        self.store.pop_blocking(&self.queue_name, timeout_secs).await
    }

    pub async fn len(&self) -> Result<u64, QueueError> {
        self.store.len(&self.queue_name).await
    }

    pub async fn is_webhook_processed(&self, webhook_id: &str) -> Result<bool, QueueError> {
        self.store.is_member(&self.processed_set_key, webhook_id).await
    }

    /// Record a delivered webhook and refresh the window on the whole set.
    pub async fn mark_webhook_as_processed(&self, webhook_id: &str) -> Result<(), QueueError> {
        self.store.add_member(&self.processed_set_key, webhook_id).await?;
        self.store
            .set_expiry(&self.processed_set_key, self.deduplication_window_seconds)
            .await?;
        debug!(
            webhook_id = %webhook_id,
            window_secs = self.deduplication_window_seconds,
            "Webhook marked as processed"
        );
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.store.ping().await
    }
}
