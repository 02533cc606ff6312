//! Wire codec for burrow connections.
//!
//! Every proxied request and response crosses a borrowed connection as a
//! single binary message. The message is a versioned protobuf envelope:
//!
//! ```text
//! Envelope {
//!     version: u32            = 1
//!     oneof payload {
//!         RequestDescriptor   = 2   (method, url, headers, body)
//!         ResponseDescriptor  = 3   (status, status_code, headers, body)
//!     }
//! }
//! ```
//!
//! Headers are an ordered list of `(name, value)` pairs so repeated keys and
//! insertion order survive the trip. Bodies are fully buffered and bounded
//! by [`Codec::max_body_bytes`].

mod codec;
mod descriptor;
mod error;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, is_hop_by_hop, Codec,
    DEFAULT_MAX_BODY_BYTES, HOP_BY_HOP_HEADERS, WIRE_VERSION,
};
pub use descriptor::{Header, RequestDescriptor, ResponseDescriptor, CONNECT};
pub use error::WireError;
