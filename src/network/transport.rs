//! Peer Transport
//!
//! The substrate delivering opaque byte messages between the two named
//! peers, with join/leave notifications. NAT traversal, encryption and
//! delivery itself are the collaborator's problem; the session only sees
//! this seam. An in-memory channel pair ships for tests and the demo.

use thiserror::Error;
use tokio::sync::mpsc;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer side of the channel is gone.
    #[error("peer transport closed")]
    Closed,
}

/// Events surfaced by the transport substrate.
#[derive(Debug)]
pub enum TransportEvent {
    /// The (single) peer joined the room.
    PeerJoined,
    /// The peer left the room.
    PeerLeft,
    /// An opaque message from the peer.
    Message(Vec<u8>),
}

/// Outbound half of the peer link.
pub trait PeerTransport: Send {
    /// Deliver bytes to the peer.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// Channel-backed transport: `send` enqueues onto the remote peer's event
/// stream.
pub struct ChannelTransport {
    remote: mpsc::UnboundedSender<TransportEvent>,
}

impl PeerTransport for ChannelTransport {
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.remote
            .send(TransportEvent::Message(bytes))
            .map_err(|_| TransportError::Closed)
    }
}

/// One side of an in-memory peer link.
pub struct MemoryPeer {
    /// Outbound transport towards the other side.
    pub transport: ChannelTransport,
    /// Inbound event stream for this side.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Injector for this side's own event stream (join/leave simulation).
    pub injector: mpsc::UnboundedSender<TransportEvent>,
}

/// Build a connected in-memory transport pair.
pub fn memory_pair() -> (MemoryPeer, MemoryPeer) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    (
        MemoryPeer {
            transport: ChannelTransport {
                remote: tx_b.clone(),
            },
            events: rx_a,
            injector: tx_a.clone(),
        },
        MemoryPeer {
            transport: ChannelTransport { remote: tx_a },
            events: rx_b,
            injector: tx_b,
        },
    )
}

// =============================================================================
// TESTS
// =============================================================================
