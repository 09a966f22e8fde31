//! Wire-layer error types.

/// Errors that can occur while encoding, decoding or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to encode a message to MessagePack.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a message from MessagePack.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The join token could not be decoded.
    #[error("malformed token: {0}")]
    Token(String),

    /// A frame was too short or otherwise malformed.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// The connection has not been opened yet.
    #[error("connection is not open")]
    NotOpen,

    /// The connection was closed.
    #[error("connection closed")]
    Closed,

    /// Any other transport-level failure, surfaced as-is.
    #[error("transport error: {0}")]
    Transport(String),
}
