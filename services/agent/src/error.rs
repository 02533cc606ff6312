//! Agent errors.
//!
//! Everything except a failed initial registration is scoped to a single
//! connection: it is logged and the supply loop carries on.

use burrow_wire::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Reading from or writing to a server connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The WebSocket handshake with the server failed or timed out.
    #[error("registration handshake failed: {0}")]
    Handshake(String),

    /// A server message was not a valid request.
    #[error("decode error: {0}")]
    Decode(String),

    /// Opening the TCP connection for a tunnel failed.
    #[error("dial {target} failed: {reason}")]
    Dial { target: String, reason: String },

    /// The outbound HTTP call failed.
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// A body exceeds the buffering limit.
    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid server url {url}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
}

impl From<WireError> for AgentError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::BodyTooLarge { limit, .. } => AgentError::BodyTooLarge { limit },
            other => AgentError::Decode(other.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AgentError::Transport(e.to_string())
    }
}
