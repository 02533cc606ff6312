//! Server configuration (env-driven).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use burrow_wire::DEFAULT_MAX_BODY_BYTES;

use crate::pool::{DEFAULT_POOL_CAPACITY, MAX_POOL_CAPACITY};

/// Default timeout for a single message write to an agent connection.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings consumed by the relays and pools.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Maximum idle connections kept per identity.
    pub pool_capacity: usize,

    /// Bound on each message write to an agent connection.
    pub write_timeout: Duration,

    /// Maximum buffered request/response body.
    pub max_body_bytes: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds to.
    pub listen_addr: SocketAddr,

    /// Relay tunables.
    pub relay: RelaySettings,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("BURROW_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("BURROW_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8080).")?;

        let pool_capacity = parse_pool_capacity(std::env::var("BURROW_POOL_CAPACITY").ok().as_deref())?;

        let write_timeout_ms: u64 = std::env::var("BURROW_WRITE_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("BURROW_WRITE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_WRITE_TIMEOUT.as_millis() as u64);
        let write_timeout = Duration::from_millis(write_timeout_ms.max(100));

        let max_body_bytes: usize = std::env::var("BURROW_MAX_BODY_BYTES")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("BURROW_MAX_BODY_BYTES must be an integer (bytes).")?
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);

        let log_level = std::env::var("BURROW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            relay: RelaySettings {
                pool_capacity,
                write_timeout,
                max_body_bytes,
            },
            log_level,
        })
    }
}

fn parse_pool_capacity(raw: Option<&str>) -> Result<usize> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_POOL_CAPACITY);
    };
    let capacity: usize = raw
        .parse()
        .context("BURROW_POOL_CAPACITY must be a positive integer.")?;
    if !(1..=MAX_POOL_CAPACITY).contains(&capacity) {
        anyhow::bail!("BURROW_POOL_CAPACITY must be between 1 and {MAX_POOL_CAPACITY}, got {capacity}.");
    }
    Ok(capacity)
}
