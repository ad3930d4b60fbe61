//! Same-network peer broadcast.
//!
//! Defines the [`PeerChannel`] trait. Concrete implementations:
//! - [`udp::UdpPeers`]: IPv4 multicast datagrams on the local network
//! - [`bus::PeerBus`]: in-process bus for tests and single-host embedding
//!
//! Delivery is fire-and-forget: no acknowledgment, no ordering, no
//! persistence. Receivers see their own datagrams too and must drop those
//! whose `origin` matches [`PeerChannel::origin`].

pub mod bus;
pub mod udp;

use opsync_proto::peer::{DatagramError, PeerDatagram, PeerPayload};
use tokio::sync::broadcast;

/// Errors that can occur on the peer channel.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The socket could not be bound or the group could not be joined.
    #[error("failed to bind peer socket: {0}")]
    Bind(#[source] std::io::Error),

    /// A datagram could not be sent.
    #[error("failed to send peer datagram: {0}")]
    Send(#[source] std::io::Error),

    /// A datagram could not be encoded.
    #[error(transparent)]
    Datagram(#[from] DatagramError),
}

/// A best-effort broadcast channel shared by co-located processes.
pub trait PeerChannel: Send + Sync + 'static {
    /// This process's origin tag, stamped on every published datagram.
    fn origin(&self) -> &str;

    /// Broadcasts `payload` on `channel`. Returns once handed to the network.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError`] if the datagram is too large or cannot be sent.
    fn publish(&self, channel: &str, payload: PeerPayload) -> Result<(), PeerError>;

    /// Receives every datagram heard from now on, own ones included.
    fn subscribe(&self) -> broadcast::Receiver<PeerDatagram>;
}

/// Returns a fresh origin tag for a process.
#[must_use]
pub fn new_origin() -> String {
    uuid::Uuid::new_v4().to_string()
}
