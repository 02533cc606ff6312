//! Agent configuration (flags with env fallbacks).

use std::time::Duration;

use burrow_wire::DEFAULT_MAX_BODY_BYTES;
use clap::Parser;
use reqwest::Url;

use crate::error::AgentError;

/// burrow agent - serve proxied requests for one identity from behind NAT.
#[derive(Debug, Clone, Parser)]
#[command(name = "burrow-agent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Base URL of the burrow server.
    #[arg(long, env = "BURROW_SERVER_URL", default_value = "http://localhost:8080")]
    pub server_url: String,

    /// Identity to register connections under.
    #[arg(long, env = "BURROW_IDENTITY")]
    pub identity: String,

    /// Idle connections to keep registered.
    #[arg(long, env = "BURROW_IDLE_CONNECTIONS", default_value_t = 1)]
    pub idle_connections: usize,

    /// Timeout for dialing a CONNECT target.
    #[arg(long, env = "BURROW_DIAL_TIMEOUT_MS", default_value_t = 10_000)]
    pub dial_timeout_ms: u64,

    /// Timeout for the WebSocket handshake with the server.
    #[arg(long, env = "BURROW_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// Timeout for each message written to the server.
    #[arg(long, env = "BURROW_WRITE_TIMEOUT_MS", default_value_t = 10_000)]
    pub write_timeout_ms: u64,

    /// Maximum buffered request/response body.
    #[arg(long, env = "BURROW_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "BURROW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate the flags into an [`AgentConfig`].
    pub fn into_config(self) -> Result<AgentConfig, AgentError> {
        let server_url = Url::parse(&self.server_url).map_err(|e| AgentError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason: e.to_string(),
        })?;

        let mut config = AgentConfig::new(server_url, self.identity)?;
        config.idle_connections = self.idle_connections.max(1);
        config.dial_timeout = Duration::from_millis(self.dial_timeout_ms);
        config.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        config.write_timeout = Duration::from_millis(self.write_timeout_ms);
        config.max_body_bytes = self.max_body_bytes;
        Ok(config)
    }
}

/// Validated agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server base URL (`http` or `https`).
    pub server_url: Url,
    pub identity: String,
    pub idle_connections: usize,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub max_body_bytes: usize,
}

impl AgentConfig {
    /// Settings with defaults for everything but the server and identity.
    pub fn new(server_url: Url, identity: impl Into<String>) -> Result<Self, AgentError> {
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(AgentError::InvalidServerUrl {
                url: server_url.to_string(),
                reason: "scheme must be http or https".to_string(),
            });
        }
        if server_url.cannot_be_a_base() {
            return Err(AgentError::InvalidServerUrl {
                url: server_url.to_string(),
                reason: "not a base URL".to_string(),
            });
        }

        let identity = identity.into();
        if identity.is_empty() {
            return Err(AgentError::InvalidServerUrl {
                url: server_url.to_string(),
                reason: "identity must not be empty".to_string(),
            });
        }

        Ok(Self {
            server_url,
            identity,
            idle_connections: 1,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// `http(s)://…/v1/sockets/{identity}`, the deregistration endpoint.
    pub fn socket_url(&self) -> Url {
        let mut url = self.server_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "sockets", self.identity.as_str()]);
        }
        url
    }

    /// `ws(s)://…/v1/sockets/{identity}`, the registration endpoint.
    pub fn register_url(&self) -> Url {
        let mut url = self.socket_url();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http -> ws and https -> wss are always permitted.
        let _ = url.set_scheme(scheme);
        url
    }
}
