//! # HEC Relay
//!
//! A reliability buffer between webhook senders and a Splunk HTTP Event
//! Collector. Signed webhooks are accepted over HTTP, queued durably in
//! Redis, and forwarded by a single background worker that skips ids already
//! delivered within the deduplication window.
//!
//! ## Architecture
//!
//! ```text
//! Client -> POST /webhook -> signature check -> Redis list
//!        -> Forwarder (BLPOP) -> dedup set -> HEC sink -> mark processed
//! ```
//!
//! ## Modules
//!
//! - [`signature`]: HMAC-SHA256 verification of `X-Signature`
//! - [`envelope`]: The queued, metadata-wrapped event
//! - [`queue`]: Queue store trait, Redis and in-memory stores
//! - [`sink`]: Downstream sink trait and the HEC client
//! - [`worker`]: The forwarding loop
//! - [`server`]: HTTP routes

pub mod config;
pub mod dlq;
pub mod envelope;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod signature;
pub mod sink;
pub mod worker;

// Re-export commonly used types at crate root
pub use envelope::QueuedEnvelope;
pub use queue::{InMemoryQueue, QueueStore, RedisQueue, WebhookQueue};
pub use sink::{DeliveryResult, HecSink, Sink};
pub use worker::Forwarder;
