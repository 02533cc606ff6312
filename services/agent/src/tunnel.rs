//! Agent half of a CONNECT tunnel: server connection <-> dialed TCP stream.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::socket::{close, send_message, ServerSocket};

/// Read buffer size for the dialed side.
pub const TUNNEL_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction of a finished tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    /// Server → target.
    pub bytes_to_target: u64,
    /// Target → server.
    pub bytes_from_target: u64,
}

/// Relay between `socket` and `stream` until either side stops, then close
/// both.
pub async fn run_tunnel(socket: ServerSocket, stream: TcpStream, write_timeout: Duration) -> TunnelStats {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut tcp_rx, mut tcp_tx) = stream.into_split();
    let cancel = CancellationToken::new();

    let to_target = async {
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
                        written = tcp_tx.write_all(&data) => written,
                    };
                    if let Err(e) = written {
                        debug!(error = %e, "Write to target failed");
                        break;
                    }
                    total += data.len() as u64;
                }
                Some(Ok(Message::Text(_))) => {
                    warn!("Text message on tunnel, closing");
                    break;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Server connection read failed");
                    break;
                }
            }
        }
        cancel.cancel();
        let _ = tokio::time::timeout(write_timeout, tcp_tx.shutdown()).await;
        total
    };

    let from_target = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; TUNNEL_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = tcp_rx.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Read from target failed");
                    break;
                }
            };

            let message = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = send_message(&mut ws_tx, message, write_timeout) => sent,
            };
            if let Err(e) = sent {
                debug!(error = %e, "Send to server failed");
                break;
            }
            total += n as u64;
        }
        cancel.cancel();
        close(&mut ws_tx, write_timeout).await;
        total
    };

    let (bytes_to_target, bytes_from_target) = tokio::join!(to_target, from_target);
    TunnelStats {
        bytes_to_target,
        bytes_from_target,
    }
}
