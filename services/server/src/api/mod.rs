//! HTTP surface: registration endpoints, health and the proxy entry point.

mod health;
pub mod proxy;
mod sockets;

use std::future::Future;
use std::io;
use std::time::Duration;

use axum::{extract::Request, middleware, Router, ServiceExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;
use tower::Layer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

/// Create the router for the non-proxy endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1/sockets", sockets::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the proxy and the API on `listener` until `shutdown` resolves.
///
/// The proxy entry wraps the router from the outside: proxy requests are
/// recognised before any route matching, since their targets (absolute-form
/// URIs, CONNECT authorities) are not paths of this server.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state.clone());
    let app = middleware::from_fn_with_state(state, proxy::proxy_entry).layer(router);

    axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Serve until `signal` resolves, then shut down gracefully.
///
/// Shutdown stops accepting new connections and closes every pool, which
/// releases parked registrations and callers still waiting for an agent.
/// Requests already being relayed get up to `drain_timeout` to finish.
pub async fn run<F>(
    listener: TcpListener,
    state: AppState,
    signal: F,
    drain_timeout: Duration,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(serve(listener, state.clone(), async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        info!("HTTP server shutting down");
    }));

    tokio::select! {
        _ = signal => info!("Received shutdown signal"),
        result = &mut server => return joined(result),
    }

    let _ = shutdown_tx.send(true);
    let closed = state.registry().close_all().await;
    info!(closed, "Closed idle agent connections");

    info!("Waiting for in-flight requests to drain...");
    match tokio::time::timeout(drain_timeout, server).await {
        Ok(result) => joined(result),
        Err(_) => {
            warn!(
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "HTTP server did not shut down in time"
            );
            Ok(())
        }
    }
}

fn joined(result: Result<io::Result<()>, JoinError>) -> io::Result<()> {
    result.map_err(io::Error::other)?
}
