//! Wire codec errors.

use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The blob is not a valid envelope.
    #[error("malformed wire message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The envelope was written by an incompatible peer.
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u32),

    /// The envelope carries neither a request nor a response.
    #[error("wire message carries no payload")]
    MissingPayload,

    /// A response arrived where a request was expected, or the reverse.
    #[error("unexpected payload: expected {expected}, found {found}")]
    UnexpectedPayload {
        expected: &'static str,
        found: &'static str,
    },

    /// Body exceeds the configured buffering limit.
    #[error("body of {size} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    /// Whole message exceeds the configured limit.
    #[error("wire message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
}
