//! Market Data Hub Binary
//!
//! Starts the hub: upstream connection, cache, rule engine and health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-hub
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_URL`: Upstream WebSocket endpoint
//!
//! ## Optional
//! - `FEED_API_KEY` / `FEED_API_SECRET`: Feed credentials (both or neither)
//! - `FEED_REQUIRE_AUTH`: Refuse to connect without credentials
//! - `FEED_MAX_RECONNECT_ATTEMPTS`: Retries before giving up (default: 5)
//! - `CACHE_STORE_DIR`: Directory of the persistent cache tier (default: in-memory)
//! - `HUB_SYMBOLS`: Comma-separated symbols recorded at startup
//! - `HUB_OHLC_TIMEFRAMES`: OHLC fan-out (default: 1m,5m,15m,1h)
//! - `HUB_RULES_FILE`: JSON file of notification rules
//! - `HUB_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_data_hub::infrastructure::health::{HealthServer, HealthServerState};
use market_data_hub::infrastructure::telemetry;
use market_data_hub::{HubConfig, HubContext, WebSocketTransport, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting Market Data Hub");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = HubConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let health_port = config.server.health_port;
    let transport = Arc::new(WebSocketTransport::new(config.feed.url.clone()));

    let hub = Arc::new(HubContext::build(config, transport).await?);
    hub.start().await?;

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&hub),
    ));
    let health_server = HealthServer::new(health_port, health_state, shutdown_token.clone());
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market data hub ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        hub.shutdown().await;
        let _ = health_task.await;
    })
    .await
    .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Market data hub stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        endpoint = %config.feed.url,
        authenticated = config.feed.credentials.is_some(),
        symbols = ?config.symbols,
        health_port = config.server.health_port,
        persistent_cache = config.cache.store_dir.is_some(),
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
