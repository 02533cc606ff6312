//! burrow server binary.

use std::time::Duration;

use anyhow::{Context, Result};
use burrow_server::{api, config, state::AppState};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on draining in-flight requests after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BURROW_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting burrow server");
    info!(
        listen_addr = %config.listen_addr,
        pool_capacity = config.relay.pool_capacity,
        write_timeout_ms = config.relay.write_timeout.as_millis() as u64,
        max_body_bytes = config.relay.max_body_bytes,
        "Configuration loaded"
    );

    let state = AppState::new(&config.relay);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };
    api::run(listener, state, signal, SHUTDOWN_TIMEOUT)
        .await
        .context("HTTP server failed")?;

    info!("Burrow server shutdown complete");
    Ok(())
}
