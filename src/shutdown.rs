//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] wraps a [`CancellationToken`] that is cancelled when the
//! process receives SIGINT or SIGTERM. The HTTP server and the forwarding
//! worker each hold a child token and stop when it fires.
//!
//! # Example
//!
//! ```rust,ignore
//! use hec_relay::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let token = shutdown.token();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = token.cancelled() => break,
//!             // ... process events
//!         }
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period for the worker to finish in-flight work.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    grace_period: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with the default 5 second grace period.
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// A token cancelled together with this signal.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM (or a manual trigger), then cancel.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {}
        }

        self.token.cancel();
    }

    /// Wait for a task to finish within the grace period, aborting it
    /// otherwise. Returns `true` if it finished on its own.
    pub async fn join_with_grace<T>(&self, mut handle: JoinHandle<T>) -> bool {
        match tokio::time::timeout(self.grace_period, &mut handle).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Task ended abnormally during shutdown");
                true
            }
            Err(_) => {
                warn!(
                    grace_secs = self.grace_period.as_secs(),
                    "Grace period elapsed, cancelling task"
                );
                handle.abort();
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grace_period() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.grace_period(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_manual_trigger_cancels_tokens() {
        let signal = ShutdownSignal::new();
        let token = signal.token();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), token.cancelled()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(500), signal.wait()).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_with_grace_aborts_stuck_task() {
        let signal = ShutdownSignal::with_grace_period(Duration::from_secs(1));
        let stuck = tokio::spawn(std::future::pending::<()>());
        assert!(!signal.join_with_grace(stuck).await);

        let quick = tokio::spawn(async {});
        assert!(signal.join_with_grace(quick).await);
    }
}
