//! Supply loop: keeps the server's pool for our identity replenished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::handler::Handler;
use crate::socket::ServerSocket;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Exponential retry delay for registration failures.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// How a registered connection ended its wait for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The server sent a relay.
    Used,
    /// The connection closed or failed before any relay arrived.
    Unused,
}

/// A supply slot held by one registered connection.
///
/// Releasing it reports the outcome before the permit is returned, so the
/// supply loop sees the outcome by the time it can register a replacement.
#[derive(Debug)]
pub struct Slot {
    permit: OwnedSemaphorePermit,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl Slot {
    pub fn new(permit: OwnedSemaphorePermit, outcomes: mpsc::UnboundedSender<Outcome>) -> Self {
        Self { permit, outcomes }
    }

    pub fn release(self, outcome: Outcome) {
        let _ = self.outcomes.send(outcome);
        drop(self.permit);
    }
}

#[derive(Debug, Deserialize)]
struct DeregisterResponse {
    closed: usize,
}

/// The client agent.
pub struct Agent {
    config: AgentConfig,
    handler: Arc<Handler>,
    http: reqwest::Client,
    next_connection: AtomicU64,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let handler = Arc::new(Handler::new(&config)?);
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(config.write_timeout)
            .build()
            .map_err(|e| AgentError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            handler,
            http,
            next_connection: AtomicU64::new(1),
        })
    }

    /// Keep `idle_connections` connections registered until `shutdown` is
    /// cancelled.
    ///
    /// Fails only if the very first registration fails. Later registration
    /// failures, and connections closed before they were used, are retried
    /// with backoff.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let permits = Arc::new(Semaphore::new(self.config.idle_connections));
        let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
        let mut backoff = Backoff::new();
        let mut registered_once = false;

        info!(
            identity = %self.config.identity,
            server_url = %self.config.server_url,
            idle_connections = self.config.idle_connections,
            "Starting supply loop"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let mut closed_unused = 0usize;
            while let Ok(outcome) = outcomes.try_recv() {
                match outcome {
                    Outcome::Used => backoff.reset(),
                    Outcome::Unused => closed_unused += 1,
                }
            }
            if closed_unused > 0 {
                let delay = backoff.next_delay();
                warn!(
                    closed_unused,
                    retry_in_ms = delay.as_millis() as u64,
                    "Connections closed before use"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let registered = tokio::select! {
                _ = shutdown.cancelled() => break,
                registered = self.register() => registered,
            };

            match registered {
                Ok(socket) => {
                    registered_once = true;

                    let slot = Slot::new(permit, outcomes_tx.clone());
                    let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    let span = tracing::info_span!("connection", connection);
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(
                        async move {
                            debug!("Connection registered");
                            handler.serve(socket, slot).await;
                        }
                        .instrument(span),
                    );
                }
                Err(e) if !registered_once => return Err(e),
                Err(e) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Registration failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Supply loop stopped");
        Ok(())
    }

    /// Open one connection and register it with the server.
    pub async fn register(&self) -> Result<ServerSocket, AgentError> {
        let url = self.config.register_url();
        let limit = self.handler.codec().max_message_bytes();
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(limit))
            .max_frame_size(Some(limit));

        let handshake = connect_async_with_config(url.as_str(), Some(ws_config), true);
        match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(AgentError::Handshake(e.to_string())),
            Err(_) => Err(AgentError::Handshake(format!(
                "timed out after {}ms",
                self.config.handshake_timeout.as_millis()
            ))),
        }
    }

    /// Ask the server to close our idle connections. Returns how many it
    /// closed.
    pub async fn deregister(&self) -> Result<usize, AgentError> {
        let response = self
            .http
            .delete(self.config.socket_url())
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!(
                "deregistration returned {status}"
            )));
        }

        let body: DeregisterResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Decode(e.to_string()))?;
        Ok(body.closed)
    }
}
