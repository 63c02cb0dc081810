//! HEC Relay - webhook intake and forwarder.
//!
//! Runs the HTTP ingress and the forwarding worker in one process.
//!
//! ## Configuration
//!
//! - `RELAY_CONFIG`: path of the TOML config (default `config/relay.toml`)
//! - `RUST_LOG`: logging filter (default `info`)
//!
//! A `.env` file is loaded first, so secrets referenced as `${VAR}` in the
//! config can live there during development.

use deadpool_redis::{Config, Runtime};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hec_relay::config::RelayConfig;
use hec_relay::metrics::Metrics;
use hec_relay::queue::{RedisQueue, WebhookQueue};
use hec_relay::server::{self, AppState};
use hec_relay::shutdown::ShutdownSignal;
use hec_relay::worker::Forwarder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Load configuration
    let config = RelayConfig::load().inspect_err(|e| error!(error = %e, "Invalid configuration"))?;

    // 3. Setup Redis pool and queue
    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;
    let queue = WebhookQueue::new(
        Arc::new(RedisQueue::new(pool)),
        config.queue.name.clone(),
        config.worker.deduplication_window_seconds,
    );

    if let Err(e) = queue.ping().await {
        error!(error = %e, url = %config.redis.url, "Redis is not reachable at startup");
    }

    let metrics = Arc::new(Metrics::new());
    let shutdown = ShutdownSignal::new();

    // 4. Start the forwarding worker
    let sink = Arc::new(config.sink.build_sink()?);
    let mut forwarder = Forwarder::new(queue.clone(), sink, config.worker.poll_interval_ms)
        .with_metrics(metrics.clone());
    if config.worker.dead_letter {
        forwarder = forwarder.with_dead_letters();
    }
    let worker = tokio::spawn(forwarder.run(shutdown.token()));

    // 5. Start the server
    let state = Arc::new(AppState::new(
        queue,
        config.ingress.shared_secret.clone(),
        metrics,
    ));
    let app = server::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HEC Relay listening on {}", addr);

    let server_token = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
    });

    // 6. Wait for SIGINT/SIGTERM, then give the worker its grace period
    shutdown.wait().await;

    info!("Shutting down forwarding worker...");
    shutdown.join_with_grace(worker).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    info!("HEC Relay stopped");
    Ok(())
}
