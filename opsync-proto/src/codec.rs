//! Binary encoding for frames exchanged with the remote store.
//!
//! Frames are postcard-encoded and carried one per WebSocket binary
//! message, so no length prefix is needed.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for wire encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds the configured size limit.
    #[error("frame too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Encodes a frame into a byte vector using postcard.
///
/// # Errors
///
/// Returns `WireError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, WireError> {
    postcard::to_allocvec(frame).map_err(|e| WireError::Serialization(e.to_string()))
}

/// Decodes a frame from a byte slice using postcard.
///
/// # Errors
///
/// Returns `WireError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    postcard::from_bytes(bytes).map_err(|e| WireError::Serialization(e.to_string()))
}

/// Decodes a frame, rejecting anything larger than `limit` bytes first.
///
/// # Errors
///
/// Returns `WireError::TooLarge` for oversized input, otherwise the same
/// errors as [`decode`].
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, WireError> {
    if bytes.len() > limit {
        return Err(WireError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    decode(bytes)
}
