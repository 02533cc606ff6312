//! Per-connection handling.
//!
//! Each registered connection waits for exactly one message from the server.
//! Its supply slot is released as soon as that message arrives, so the
//! supply loop registers a replacement while this one is still being served.
//! A connection that ends before any message arrives releases its slot as
//! unused, which the supply loop backs off on.

use std::time::Duration;

use burrow_wire::{Codec, RequestDescriptor};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::fetch::{bad_gateway, Fetcher};
use crate::socket::{close, send_message, ServerSocket};
use crate::supply::{Outcome, Slot};
use crate::tunnel::run_tunnel;

/// Serves relays arriving on registered connections.
#[derive(Debug, Clone)]
pub struct Handler {
    codec: Codec,
    fetcher: Fetcher,
    dial_timeout: Duration,
    write_timeout: Duration,
}

impl Handler {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        Ok(Self {
            codec: Codec::new(config.max_body_bytes),
            fetcher: Fetcher::new(config.max_body_bytes)?,
            dial_timeout: config.dial_timeout,
            write_timeout: config.write_timeout,
        })
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Wait for the first message on `socket`, release `slot`, then serve
    /// it. Errors are logged here and never propagate.
    pub async fn serve(&self, mut socket: ServerSocket, slot: Slot) {
        let first = loop {
            match socket.next().await {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(Message::Text(_))) => {
                    warn!("Unexpected text message, dropping connection");
                    close(&mut socket, self.write_timeout).await;
                    slot.release(Outcome::Unused);
                    return;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Connection closed by server before use");
                    slot.release(Outcome::Unused);
                    return;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "Connection failed before use");
                    slot.release(Outcome::Unused);
                    return;
                }
            }
        };
        slot.release(Outcome::Used);

        if let Err(e) = self.handle(socket, &first).await {
            warn!(error = %e, "Relay failed");
        }
    }

    async fn handle(&self, mut socket: ServerSocket, blob: &[u8]) -> Result<(), AgentError> {
        let request = match self.codec.decode_request(blob) {
            Ok(request) => request,
            Err(e) => {
                close(&mut socket, self.write_timeout).await;
                return Err(e.into());
            }
        };

        if request.is_connect() {
            self.tunnel(socket, &request).await
        } else {
            self.fetch(socket, &request).await
        }
    }

    async fn fetch(&self, mut socket: ServerSocket, request: &RequestDescriptor) -> Result<(), AgentError> {
        let response = match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(method = %request.method, url = %request.url, error = %e, "Fetch failed");
                bad_gateway(&e)
            }
        };
        info!(
            method = %request.method,
            url = %request.url,
            status = response.status_code,
            "Request served"
        );

        let result = match self.codec.encode_response(&response) {
            Ok(payload) => send_message(&mut socket, Message::Binary(payload), self.write_timeout).await,
            Err(e) => Err(e.into()),
        };
        close(&mut socket, self.write_timeout).await;
        result
    }

    async fn tunnel(&self, mut socket: ServerSocket, request: &RequestDescriptor) -> Result<(), AgentError> {
        let target = request.url.as_str();
        let stream = match dial(target, self.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                close(&mut socket, self.write_timeout).await;
                return Err(e);
            }
        };
        debug!(target, "Tunnel target dialed");

        let stats = run_tunnel(socket, stream, self.write_timeout).await;
        info!(
            target,
            bytes_to_target = stats.bytes_to_target,
            bytes_from_target = stats.bytes_from_target,
            "Tunnel closed"
        );
        Ok(())
    }
}

async fn dial(target: &str, timeout: Duration) -> Result<TcpStream, AgentError> {
    let dial_error = |reason: String| AgentError::Dial {
        target: target.to_string(),
        reason,
    };

    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(dial_error(e.to_string())),
        Err(_) => Err(dial_error(format!("timed out after {}ms", timeout.as_millis()))),
    }
}
