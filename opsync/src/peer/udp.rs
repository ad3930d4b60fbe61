//! IPv4 multicast peer channel.
//!
//! Every process joins the same group and port; a datagram sent to the
//! group reaches every member, the sender included (multicast loopback is
//! on so co-located processes on one host hear each other).

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use opsync_proto::peer::{self, MAX_DATAGRAM_SIZE, PeerDatagram, PeerPayload};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{PeerChannel, PeerError, new_origin};

/// Datagrams buffered per local receiver.
const RECEIVE_CAPACITY: usize = 256;

/// Multicast hop limit; peers are on the local segment only.
const MULTICAST_TTL: u32 = 1;

/// A joined multicast group.
///
/// Dropping it leaves the group and stops the reader task.
pub struct UdpPeers {
    origin: String,
    socket: Arc<UdpSocket>,
    target: SocketAddrV4,
    tx: broadcast::Sender<PeerDatagram>,
    reader: JoinHandle<()>,
}

impl UdpPeers {
    /// Binds `0.0.0.0:port` and joins `group`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Bind`] if the port is taken or the group
    /// cannot be joined.
    pub fn bind(group: Ipv4Addr, port: u16) -> Result<Self, PeerError> {
        let std_socket =
            StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(PeerError::Bind)?;
        std_socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(PeerError::Bind)?;
        std_socket
            .set_multicast_loop_v4(true)
            .map_err(PeerError::Bind)?;
        std_socket
            .set_multicast_ttl_v4(MULTICAST_TTL)
            .map_err(PeerError::Bind)?;
        std_socket.set_nonblocking(true).map_err(PeerError::Bind)?;
        let local_port = std_socket.local_addr().map_err(PeerError::Bind)?.port();
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(PeerError::Bind)?);

        let (tx, _) = broadcast::channel(RECEIVE_CAPACITY);
        let reader = tokio::spawn(read_loop(Arc::clone(&socket), tx.clone()));
        tracing::info!(%group, port = local_port, "joined peer multicast group");

        Ok(Self {
            origin: new_origin(),
            socket,
            target: SocketAddrV4::new(group, local_port),
            tx,
            reader,
        })
    }

    /// The port actually bound; differs from the requested one only for port 0.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.target.port()
    }
}

impl std::fmt::Debug for UdpPeers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPeers")
            .field("origin", &self.origin)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Drop for UdpPeers {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl PeerChannel for UdpPeers {
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
        self.socket
            .try_send_to(&bytes, self.target.into())
            .map_err(PeerError::Send)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerDatagram> {
        self.tx.subscribe()
    }
}

async fn read_loop(socket: Arc<UdpSocket>, tx: broadcast::Sender<PeerDatagram>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "peer socket receive failed");
                continue;
            }
        };
        match peer::decode(&buf[..len]) {
            Ok(datagram) => {
                let _ = tx.send(datagram);
            }
            Err(e) => tracing::debug!(%from, error = %e, "ignoring peer datagram"),
        }
    }
}
