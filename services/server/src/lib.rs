//! burrow server
//!
//! Public-facing half of a reverse-tunnel HTTP proxy. Agents behind NAT
//! register outbound WebSocket connections per identity; proxy requests for
//! that identity borrow one connection each, either for a single
//! request/response exchange or for a CONNECT byte tunnel.

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod state;

pub use connection::{completion, Completion, Connection, Released};
pub use error::{ProxyError, PROXY_REALM};
pub use pool::{Closable, Pool, PoolClosed, DEFAULT_POOL_CAPACITY};
pub use registry::{PoolStats, Registry};
pub use relay::{relay_request, run_tunnel, TunnelStats, TUNNEL_BUFFER_SIZE};
pub use state::AppState;
