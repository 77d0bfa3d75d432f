//! Common Errors

use thiserror::Error;

/// Errors raised while decoding signaling frames or payloads.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame could not be encoded or decoded as JSON.
    #[error("Invalid signaling frame: {0}")]
    Frame(#[from] serde_json::Error),

    /// A signal carried a payload that does not match its declared type.
    #[error("Invalid {kind} payload: {reason}")]
    Payload {
        /// Declared signal type.
        kind: &'static str,
        /// Decoder message.
        reason: String,
    },
}

/// Convenience alias for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
