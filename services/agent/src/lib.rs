//! burrow agent
//!
//! Runs behind NAT next to the services it exposes. It keeps a few outbound
//! WebSocket connections registered with the burrow server; each one is
//! borrowed by the server for a single relay, which the agent completes by
//! performing the real HTTP fetch or TCP dial.

pub mod config;
pub mod error;
pub mod fetch;
pub mod handler;
pub mod socket;
pub mod supply;
pub mod tunnel;

pub use config::{AgentConfig, Args};
pub use error::AgentError;
pub use fetch::{bad_gateway, Fetcher};
pub use handler::Handler;
pub use supply::Agent;
pub use tunnel::{run_tunnel, TunnelStats};
