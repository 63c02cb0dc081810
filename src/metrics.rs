//! In-process counters shared by the ingestion endpoint and the worker.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay counters. Shared behind an `Arc`; all updates are relaxed.
#[derive(Debug)]
pub struct Metrics {
    start_time: Instant,

    /// Requests that reached the ingestion endpoint
    pub received: AtomicU64,
    /// Requests refused (bad signature, bad headers, bad body)
    pub rejected: AtomicU64,
    /// Envelopes pushed onto the queue
    pub enqueued: AtomicU64,

    pub forwarded: AtomicU64,
    pub duplicates: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// JSON view served on `/metrics`.
    pub fn snapshot(&self) -> Value {
        let uptime = self.uptime_seconds();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime,
            "uptime": format_uptime(uptime),
            "ingress": {
                "received": load(&self.received),
                "rejected": load(&self.rejected),
                "enqueued": load(&self.enqueued),
            },
            "worker": {
                "forwarded": load(&self.forwarded),
                "duplicates": load(&self.duplicates),
                "failed": load(&self.failed),
                "dead_lettered": load(&self.dead_lettered),
            },
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn format_uptime(uptime: u64) -> String {
    if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    }
}
