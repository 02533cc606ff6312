//! burrow agent binary.

use std::time::Duration;

use anyhow::{Context, Result};
use burrow_agent::{Agent, Args};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on the deregistration call made on the way out.
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = args.into_config().context("invalid agent configuration")?;
    info!(
        server_url = %config.server_url,
        identity = %config.identity,
        idle_connections = config.idle_connections,
        "Starting burrow agent"
    );

    let agent = Agent::new(config)?;
    let shutdown = CancellationToken::new();

    tokio::select! {
        result = agent.run(shutdown.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "Agent failed");
                return Err(e).context("agent failed to start");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    }

    match tokio::time::timeout(DEREGISTER_TIMEOUT, agent.deregister()).await {
        Ok(Ok(closed)) => info!(closed, "Deregistered"),
        Ok(Err(e)) => warn!(error = %e, "Deregistration failed"),
        Err(_) => warn!("Deregistration timed out"),
    }

    info!("Burrow agent shutdown complete");
    Ok(())
}
