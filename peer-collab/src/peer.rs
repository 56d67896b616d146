//! One direct connection to one remote room participant.
//!
//! ```text
//!  Created ──first signal──► Signaling ──Connect──► Connected ──step-2──► Synced
//!     │                          │                      │                   │
//!     └──────────────────────────┴──── Close / Error ───┴───────────────────┴──► Closed
//! ```
//!
//! A link owns its transport and runs the sync and awareness protocols over
//! it. It never retries; the room drops it once it reports [`PeerUpdate::Closed`]
//! or [`PeerUpdate::Failed`], and re-announces after a failure.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use yrs::{Doc, Origin};

use crate::presence::{Awareness, AwarenessOrigin};
use crate::protocol::Message;
use crate::room::RoomEvent;
use crate::signaling::{Envelope, PeerId, SignalingLink};
use crate::sync::{self, SyncKind};
use crate::transport::{PeerTransport, TransportEvent, TransportFactory, TransportSink};

/// Link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    Signaling,
    Connected,
    Synced,
    Closed,
}

/// What the room has to do after a link handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerUpdate {
    None,
    /// The link just finished its first sync.
    Synced,
    /// The remote closed the link; remove it.
    Closed,
    /// The link failed; remove it and look for the peer again.
    Failed,
}

/// Room state a link needs while handling an event.
pub(crate) struct PeerContext<'a> {
    pub room: &'a str,
    pub local_peer: &'a str,
    pub doc: &'a Doc,
    pub awareness: &'a Awareness,
    pub origin: &'a Origin,
    pub links: &'a [SignalingLink],
}

pub struct PeerLink {
    remote: PeerId,
    link_id: u64,
    initiator: bool,
    state: PeerState,
    synced: bool,
    created: Instant,
    /// Last offer handed to the transport.
    offer: Option<Value>,
    transport: Box<dyn PeerTransport>,
}

impl PeerLink {
    pub(crate) fn new(
        remote: PeerId,
        link_id: u64,
        initiator: bool,
        factory: &dyn TransportFactory,
        room_events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        let sink = TransportSink::new(remote.clone(), link_id, room_events);
        let transport = factory.create(initiator, sink);
        Self {
            remote,
            link_id,
            initiator,
            state: PeerState::Created,
            synced: false,
            created: Instant::now(),
            offer: None,
            transport,
        }
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.remote
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, PeerState::Connected | PeerState::Synced)
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Still not connected `limit` after creation, as seen at `now`.
    pub(crate) fn is_stalled(&self, now: Instant, limit: Duration) -> bool {
        !self.is_connected()
            && self.state != PeerState::Closed
            && now.saturating_duration_since(self.created) >= limit
    }

    /// Whether `signal` is an offer this link has not seen yet.
    pub(crate) fn is_new_offer(&self, signal: &Value) -> bool {
        is_offer(signal) && self.offer.as_ref() != Some(signal)
    }

    /// Feed a handshake payload from the remote peer to the transport.
    /// Repeated offers (one copy per relay) reach the transport once.
    pub(crate) fn signal(&mut self, signal: Value) {
        if self.state == PeerState::Closed {
            return;
        }
        if is_offer(&signal) {
            if self.offer.as_ref() == Some(&signal) {
                return;
            }
            self.offer = Some(signal.clone());
        }
        self.transport.signal(signal);
    }

    pub(crate) fn handle_event(&mut self, ctx: &PeerContext<'_>, event: TransportEvent) -> PeerUpdate {
        if self.state == PeerState::Closed {
            return PeerUpdate::None;
        }
        match event {
            TransportEvent::Signal(signal) => {
                self.publish_signal(ctx, signal);
                PeerUpdate::None
            }
            TransportEvent::Connect => {
                self.on_connect(ctx);
                PeerUpdate::None
            }
            TransportEvent::Data(bytes) => self.on_data(ctx, &bytes),
            TransportEvent::Close => {
                log::info!("Peer {} left room '{}'", self.remote, ctx.room);
                self.close();
                PeerUpdate::Closed
            }
            TransportEvent::Error(e) => {
                log::warn!("Connection to peer {} in '{}' failed: {e}", self.remote, ctx.room);
                self.close();
                PeerUpdate::Failed
            }
        }
    }

    fn publish_signal(&mut self, ctx: &PeerContext<'_>, signal: Value) {
        if self.state == PeerState::Created {
            self.state = PeerState::Signaling;
        }
        let envelope = Envelope::Signal {
            from: ctx.local_peer.to_string(),
            to: self.remote.clone(),
            signal,
        };
        for link in ctx.links {
            link.publish(ctx.room, envelope.clone());
        }
    }

    fn on_connect(&mut self, ctx: &PeerContext<'_>) {
        log::info!("Connected to peer {} in '{}'", self.remote, ctx.room);
        self.state = PeerState::Connected;

        self.send(Message::Sync(sync::step1(ctx.doc)).encode());
        let clients = ctx.awareness.client_ids();
        if !clients.is_empty() {
            self.send(Message::Awareness(ctx.awareness.encode_update(&clients)).encode());
        }
    }

    fn on_data(&mut self, ctx: &PeerContext<'_>, bytes: &[u8]) -> PeerUpdate {
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Malformed message from peer {}: {e}", self.remote);
                return PeerUpdate::None;
            }
        };

        match msg {
            Message::Sync(sync_msg) => match sync::handle_sync_message(ctx.doc, sync_msg, ctx.origin) {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply {
                        self.send(Message::Sync(reply).encode());
                    }
                    if outcome.kind == SyncKind::Step2 && !self.synced {
                        self.synced = true;
                        self.state = PeerState::Synced;
                        log::debug!("Synced with peer {} in '{}'", self.remote, ctx.room);
                        return PeerUpdate::Synced;
                    }
                }
                Err(e) => log::warn!("Failed to apply sync message from peer {}: {e}", self.remote),
            },
            Message::QueryAwareness => {
                let clients = ctx.awareness.client_ids();
                self.send(Message::Awareness(ctx.awareness.encode_update(&clients)).encode());
            }
            Message::Awareness(update) => {
                if let Err(e) = ctx.awareness.apply_update(&update, AwarenessOrigin::Remote) {
                    log::warn!("Failed to apply awareness from peer {}: {e}", self.remote);
                }
            }
            Message::Unknown(tag) => {
                log::warn!("Unknown message type {tag} from peer {}", self.remote);
            }
        }
        PeerUpdate::None
    }

    /// Unicast to this peer. Ignored until the transport connects.
    pub(crate) fn send(&mut self, bytes: Vec<u8>) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.transport.send(bytes) {
            log::debug!("Send to peer {} failed: {e}", self.remote);
        }
    }

    pub(crate) fn close(&mut self) {
        if self.state == PeerState::Closed {
            return;
        }
        self.state = PeerState::Closed;
        self.transport.close();
    }
}

fn is_offer(signal: &Value) -> bool {
    signal.get("type").and_then(Value::as_str) == Some("offer")
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("link_id", &self.link_id)
            .field("initiator", &self.initiator)
            .field("state", &self.state)
            .field("synced", &self.synced)
            .finish()
    }
}
