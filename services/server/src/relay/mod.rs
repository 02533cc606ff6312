//! Relays over borrowed agent connections.
//!
//! ```text
//! caller ──HTTP──> server ──ws message──> agent ──HTTP/TCP──> destination
//!        <──────── server <──ws message── agent <──────────── destination
//! ```
//!
//! - [`relay_request`]: one request, one response, then the connection is
//!   closed.
//! - [`run_tunnel`]: a full-duplex byte stream for CONNECT, torn down as a
//!   whole when either side stops.

mod request;
mod tunnel;

pub use request::relay_request;
pub use tunnel::{run_tunnel, TunnelStats, TUNNEL_BUFFER_SIZE};
