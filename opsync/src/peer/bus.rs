//! In-process peer bus.
//!
//! Every [`BusPeer`] joined to the same [`PeerBus`] hears every other one,
//! the way processes on one network hear each other's multicast.
//! Datagrams go through the wire encoding, so size limits match the UDP
//! channel.

use opsync_proto::peer::{self, PeerDatagram, PeerPayload};
use tokio::sync::broadcast;

use super::{PeerChannel, PeerError, new_origin};

/// Default number of datagrams buffered per receiver.
const BUS_CAPACITY: usize = 256;

/// A shared in-process broadcast medium.
#[derive(Debug, Clone)]
pub struct PeerBus {
    tx: broadcast::Sender<PeerDatagram>,
}

impl Default for PeerBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(BUS_CAPACITY).0,
        }
    }

    /// Joins the bus with a fresh origin.
    #[must_use]
    pub fn join(&self) -> BusPeer {
        BusPeer {
            origin: new_origin(),
            tx: self.tx.clone(),
        }
    }
}

/// One participant on a [`PeerBus`].
#[derive(Debug)]
pub struct BusPeer {
    origin: String,
    tx: broadcast::Sender<PeerDatagram>,
}

impl PeerChannel for BusPeer {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn publish(&self, channel: &str, payload: PeerPayload) -> Result<(), PeerError> {
        let datagram = PeerDatagram {
            channel: channel.to_string(),
            origin: self.origin.clone(),
            payload,
        };
        let bytes = peer::encode(&datagram)?;
        let datagram = peer::decode(&bytes)?;
        // no listeners is not an error on a broadcast medium
        let _ = self.tx.send(datagram);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerDatagram> {
        self.tx.subscribe()
    }
}
