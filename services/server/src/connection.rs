//! Agent-contributed connections.
//!
//! A [`Connection`] wraps the upgraded WebSocket of one registration. The
//! registering handler keeps a [`Released`] handle and waits on it; the relay
//! that borrows the connection fires the paired [`Completion`] when it is
//! done. `Completion` also fires on drop, so every exit path releases the
//! registering handler exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::pool::Closable;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One-shot signal fired when a borrowed connection's single use is over.
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<()>>,
}

impl Completion {
    /// Fire the signal. Later calls are no-ops.
    pub fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }

    /// Whether the signal has fired.
    pub fn is_signaled(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Waiting side of a [`Completion`], held by the registering handler.
#[derive(Debug)]
pub struct Released {
    rx: oneshot::Receiver<()>,
}

impl Released {
    /// Wait until the connection has been used (or discarded).
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// Create a linked completion pair.
pub fn completion() -> (Completion, Released) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx: Some(tx) }, Released { rx })
}

/// An idle or borrowed agent connection.
pub struct Connection {
    id: u64,
    socket: WebSocket,
    completion: Completion,
    write_timeout: Duration,
}

/// The pieces of a connection, for relays that split the socket.
pub(crate) struct Parts {
    pub id: u64,
    pub socket: WebSocket,
    pub completion: Completion,
    pub write_timeout: Duration,
}

impl Connection {
    /// Wrap a freshly upgraded socket.
    pub fn new(socket: WebSocket, write_timeout: Duration) -> (Self, Released) {
        let (completion, released) = completion();
        let conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            socket,
            completion,
            write_timeout,
        };
        (conn, released)
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send one binary message, bounded by the write timeout.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), ProxyError> {
        send_message(&mut self.socket, Message::Binary(payload), self.write_timeout).await
    }

    /// Receive exactly one binary message. Ping/pong frames are skipped.
    pub async fn recv(&mut self) -> Result<Bytes, ProxyError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(ProxyError::Decode(
                        "text message where a binary reply was expected".to_string(),
                    ))
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ProxyError::Transport(
                        "connection closed by agent".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(ProxyError::Transport(e.to_string())),
            }
        }
    }

    /// Close the socket and fire the completion signal.
    pub async fn finish(self) {
        let Parts {
            mut socket,
            mut completion,
            write_timeout,
            ..
        } = self.into_parts();
        let _ = send_message(&mut socket, close_message("done"), write_timeout).await;
        completion.signal();
    }

    pub(crate) fn into_parts(self) -> Parts {
        Parts {
            id: self.id,
            socket: self.socket,
            completion: self.completion,
            write_timeout: self.write_timeout,
        }
    }
}

#[async_trait]
impl Closable for Connection {
    async fn close(self) {
        self.finish().await;
    }
}

/// A normal-closure close frame.
pub(crate) fn close_message(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    }))
}

/// Send `message` on `sink`, failing with a transport error after `timeout`.
pub(crate) async fn send_message<S>(
    sink: &mut S,
    message: Message,
    timeout: Duration,
) -> Result<(), ProxyError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match tokio::time::timeout(timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ProxyError::Transport(e.to_string())),
        Err(_) => Err(ProxyError::Transport("write timeout".to_string())),
    }
}
