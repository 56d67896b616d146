//! Peer-to-peer transport seam.
//!
//! A [`PeerLink`](crate::peer::PeerLink) never talks to a socket directly.
//! It drives a boxed [`PeerTransport`] and receives everything the
//! transport has to say as [`TransportEvent`]s on the owning room's queue:
//!
//! ```text
//!   PeerLink ──signal()/send()/close()──► PeerTransport
//!      ▲                                       │
//!      └──── RoomEvent::Transport ◄── TransportSink::emit(event)
//! ```
//!
//! Handshake payloads (`TransportEvent::Signal`) are opaque JSON; the room
//! relays them to the remote peer through the signaling bus.

pub mod memory;
pub mod tcp;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::room::RoomEvent;
use crate::signaling::PeerId;

pub use memory::MemoryNetwork;
pub use tcp::TcpTransportFactory;

/// Something a transport reports back to its link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake payload to forward to the remote peer.
    Signal(Value),
    /// The data channel is open.
    Connect,
    /// One inbound message.
    Data(Vec<u8>),
    /// The channel closed.
    Close,
    /// The channel failed and is unusable.
    Error(String),
}

/// Transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport closed")]
    Closed,

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Handle a transport uses to report events to its owning room.
///
/// Every event is tagged with the remote peer id and the link generation,
/// so late events from a replaced or closed link are ignored.
#[derive(Debug, Clone)]
pub struct TransportSink {
    peer: PeerId,
    link_id: u64,
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl TransportSink {
    pub(crate) fn new(peer: PeerId, link_id: u64, tx: mpsc::UnboundedSender<RoomEvent>) -> Self {
        Self { peer, link_id, tx }
    }

    /// Deliver an event. Returns `false` once the room is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(RoomEvent::Transport {
                peer: self.peer.clone(),
                link_id: self.link_id,
                event,
            })
            .is_ok()
    }

    /// Remote peer this sink reports for.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// One bidirectional message channel to a remote peer.
pub trait PeerTransport: Send {
    /// Feed a handshake payload received from the remote peer.
    fn signal(&mut self, signal: Value);

    /// Send one message. Each call is delivered as a single message.
    fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Tear the channel down. Idempotent.
    fn close(&mut self);
}

/// Creates transports for new peer links.
pub trait TransportFactory: Send + Sync {
    /// `initiator` is true for the side that starts the handshake.
    fn create(&self, initiator: bool, sink: TransportSink) -> Box<dyn PeerTransport>;
}
