//! Server connection plumbing shared by the handler and the tunnel.

use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::AgentError;

/// One registered connection to the server.
pub type ServerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Send `message`, failing with a transport error after `timeout`.
pub async fn send_message<S>(sink: &mut S, message: Message, timeout: Duration) -> Result<(), AgentError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(timeout, sink.send(message)).await {
        Ok(result) => result.map_err(AgentError::from),
        Err(_) => Err(AgentError::Transport("write timeout".to_string())),
    }
}

/// Best-effort close: send a close frame and flush, bounded by `timeout`.
pub async fn close<S>(sink: &mut S, timeout: Duration)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let _ = tokio::time::timeout(timeout, sink.close()).await;
}
