//! Proxy errors and their HTTP mapping.

use axum::{
    http::{header::PROXY_AUTHENTICATE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use burrow_wire::WireError;
use serde::Serialize;
use thiserror::Error;

use crate::pool::PoolClosed;

/// Realm advertised in `Proxy-Authenticate` challenges.
pub const PROXY_REALM: &str = "burrow";

/// Errors surfaced to the original caller of a proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Reading from or writing to the agent connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The agent's reply was not a valid response message.
    #[error("decode error: {0}")]
    Decode(String),

    /// The identity's pool was torn down while waiting for a connection.
    #[error("connection pool closed")]
    PoolClosed,

    /// No usable proxy credential on a request that requires one.
    #[error("proxy authorization required: {0}")]
    AuthMissing(&'static str),

    /// The request body exceeds the buffering limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The request target cannot be proxied.
    #[error("bad proxy target: {0}")]
    BadTarget(String),
}

impl ProxyError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Transport(_) | ProxyError::Decode(_) => StatusCode::BAD_GATEWAY,
            ProxyError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::AuthMissing(_) => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BadTarget(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Transport(_) => "transport_error",
            ProxyError::Decode(_) => "decode_error",
            ProxyError::PoolClosed => "pool_closed",
            ProxyError::AuthMissing(_) => "auth_missing",
            ProxyError::BodyTooLarge { .. } => "body_too_large",
            ProxyError::BadTarget(_) => "bad_target",
        }
    }
}

impl From<PoolClosed> for ProxyError {
    fn from(_: PoolClosed) -> Self {
        ProxyError::PoolClosed
    }
}

impl From<WireError> for ProxyError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::BodyTooLarge { limit, .. } => ProxyError::BodyTooLarge { limit },
            other => ProxyError::Decode(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let problem = ProblemDetails {
            r#type: format!("https://burrow.dev/problems/{code}"),
            title: status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            status: status.as_u16(),
            detail: self.to_string(),
            code: code.to_string(),
        };

        let mut response = (status, Json(problem)).into_response();
        if matches!(self, ProxyError::AuthMissing(_)) {
            let challenge = format!("Basic realm=\"{PROXY_REALM}\"");
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert(PROXY_AUTHENTICATE, value);
            }
        }
        response
    }
}
