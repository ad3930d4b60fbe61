//! Datagrams exchanged on the same-network peer channel.
//!
//! Datagrams are plain JSON so any co-located process can read them:
//!
//! ```json
//! {"channel":"opsync:tasks","origin":"…","payload":{"action":"upsert","record":{…}}}
//! {"channel":"opsync:tasks","origin":"…","payload":{"action":"delete","id":"…"}}
//! ```

use serde::{Deserialize, Serialize};

/// Largest datagram a sender will emit or a receiver will accept.
pub const MAX_DATAGRAM_SIZE: usize = 60 * 1024;

/// Peer channel carrying task mutations.
pub const TASKS_CHANNEL: &str = "opsync:tasks";

/// Peer channel carrying message mutations.
pub const MESSAGES_CHANNEL: &str = "opsync:messages";

/// A mutation announced to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PeerPayload {
    /// Insert or replace a record (canonical camelCase JSON).
    Upsert {
        /// The full record.
        record: serde_json::Value,
    },
    /// Remove a record.
    Delete {
        /// Id of the removed record.
        id: String,
    },
}

/// One peer datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDatagram {
    /// Logical channel, e.g. [`TASKS_CHANNEL`].
    pub channel: String,
    /// Sender's process origin; receivers drop their own datagrams.
    pub origin: String,
    /// The mutation.
    pub payload: PeerPayload,
}

/// Error type for datagram encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    /// The datagram is not valid JSON of the expected shape.
    #[error("malformed datagram: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The datagram exceeds [`MAX_DATAGRAM_SIZE`].
    #[error("datagram too large: {0} bytes")]
    TooLarge(usize),
}

/// Encodes a datagram as JSON bytes.
///
/// # Errors
///
/// Returns `DatagramError::TooLarge` if the encoding exceeds
/// [`MAX_DATAGRAM_SIZE`].
pub fn encode(datagram: &PeerDatagram) -> Result<Vec<u8>, DatagramError> {
    let bytes = serde_json::to_vec(datagram)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DatagramError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Decodes a datagram from JSON bytes.
///
/// # Errors
///
/// Returns `DatagramError::Malformed` for anything that is not a datagram.
pub fn decode(bytes: &[u8]) -> Result<PeerDatagram, DatagramError> {
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DatagramError::TooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}
