//! Agent registration endpoints.
//!
//! `GET /v1/sockets/{identity}` upgrades to a WebSocket and contributes it to
//! the identity's pool. The handler then parks until the connection has been
//! used by a relay (or drained), which keeps the upgraded socket owned by
//! exactly one task at a time.

use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use crate::connection::Connection;
use crate::registry::PoolStats;
use crate::state::AppState;

/// Deregistration result.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct DeregisterResponse {
    pub message: String,
    pub identity: String,
    /// Idle connections closed.
    pub closed: usize,
}

/// Create socket registration routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pools))
        .route("/{identity}", get(register).delete(deregister))
}

async fn register(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let limit = state.codec().max_message_bytes();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| {
            let span = tracing::info_span!("register", identity = %identity);
            contribute(state, identity, socket).instrument(span)
        })
}

async fn contribute(state: AppState, identity: String, socket: WebSocket) {
    let pool = state.registry().get_or_create(&identity).await;
    let (conn, released) = Connection::new(socket, state.write_timeout());
    let connection_id = conn.id();

    if let Err(e) = pool.contribute(conn).await {
        warn!(connection_id, error = %e, "Rejected agent connection");
        return;
    }
    debug!(connection_id, idle = pool.idle_count(), "Agent connection registered");

    released.wait().await;
    debug!(connection_id, "Agent connection released");
}

async fn deregister(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> impl IntoResponse {
    let closed = state.registry().deregister(&identity).await;
    info!(identity = %identity, closed, "Deregistration requested");

    Json(DeregisterResponse {
        message: "ok".to_string(),
        identity,
        closed,
    })
}

async fn list_pools(State(state): State<AppState>) -> Json<Vec<PoolStats>> {
    Json(state.registry().snapshot().await)
}
