//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Duration;

use burrow_wire::Codec;

use crate::config::RelaySettings;
use crate::connection::Connection;
use crate::registry::Registry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Registry<Connection>,
    codec: Codec,
    write_timeout: Duration,
}

impl AppState {
    /// Create a new application state.
    pub fn new(settings: &RelaySettings) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry: Registry::with_capacity(settings.pool_capacity),
                codec: Codec::new(settings.max_body_bytes),
                write_timeout: settings.write_timeout,
            }),
        }
    }

    /// Identity → pool registry.
    pub fn registry(&self) -> &Registry<Connection> {
        &self.inner.registry
    }

    /// Wire codec carrying the body limit.
    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    /// Bound on each write to an agent connection.
    pub fn write_timeout(&self) -> Duration {
        self.inner.write_timeout
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(&RelaySettings::default())
    }
}
