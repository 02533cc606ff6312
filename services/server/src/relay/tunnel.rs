//! Bidirectional CONNECT tunnel relay.
//!
//! Bytes read from the caller become binary messages on the agent
//! connection, and binary messages from the agent are written back to the
//! caller. Both directions share a cancellation token: whichever stops first
//! cancels the other, which is always blocked in a `select!` against the
//! token and therefore unblocks immediately.

use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{close_message, send_message, Connection, Parts};

/// Read buffer size for the caller side of a tunnel.
pub const TUNNEL_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction of a finished tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    /// Caller → agent.
    pub bytes_to_agent: u64,
    /// Agent → caller.
    pub bytes_from_agent: u64,
}

/// Relay bytes between `raw` (the caller's upgraded transport) and `conn`
/// until either side stops. Both transports are closed and the connection's
/// completion signal fired before returning.
pub async fn run_tunnel<S>(conn: Connection, raw: S) -> TunnelStats
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let Parts {
        id: connection_id,
        socket,
        mut completion,
        write_timeout,
    } = conn.into_parts();

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut raw_rx, mut raw_tx) = tokio::io::split(raw);
    let cancel = CancellationToken::new();

    let from_agent = async {
        let mut total = 0u64;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = ws_rx.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(data))) => {
                    let written = tokio::select! {
                        _ = cancel.cancelled() => break,
                        written = raw_tx.write_all(&data) => written,
                    };
                    if let Err(e) = written {
                        debug!(connection_id, error = %e, "Write to caller failed");
                        break;
                    }
                    total += data.len() as u64;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Text(_))) => {
                    warn!(connection_id, "Text message on tunnel, closing");
                    break;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection_id, error = %e, "Agent connection read failed");
                    break;
                }
            }
        }
        cancel.cancel();
        let _ = tokio::time::timeout(write_timeout, raw_tx.shutdown()).await;
        total
    };

    let to_agent = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; TUNNEL_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = raw_rx.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(connection_id, error = %e, "Read from caller failed");
                    break;
                }
            };

            let message = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = send_message(&mut ws_tx, message, write_timeout) => sent,
            };
            if let Err(e) = sent {
                debug!(connection_id, error = %e, "Send to agent failed");
                break;
            }
            total += n as u64;
        }
        cancel.cancel();
        close_sink(&mut ws_tx, write_timeout).await;
        total
    };

    let (bytes_from_agent, bytes_to_agent) = tokio::join!(from_agent, to_agent);
    completion.signal();

    TunnelStats {
        bytes_to_agent,
        bytes_from_agent,
    }
}

async fn close_sink<S>(sink: &mut S, timeout: Duration)
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let _ = send_message(sink, close_message("tunnel closed"), timeout).await;
    let _ = tokio::time::timeout(timeout, sink.close()).await;
}
