//! A room: every peer link for one shared document.
//!
//! ```text
//!                  ┌──────────────── room task ────────────────┐
//!  SignalingLink ─►│                                           │
//!  transports    ─►│  RoomEvent queue ─► Room ─► PeerLink × N  │─► transports
//!  doc observer  ─►│                      │                    │
//!  awareness     ─►│                      └─► SyncNotifier ────│─► session
//!                  └───────────────────────────────────────────┘
//! ```
//!
//! All room and link state is owned by one task, so nothing here locks.
//! Transport callbacks, relay envelopes and local edits arrive as
//! [`RoomEvent`]s and are handled one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use yrs::{Doc, Origin};

use crate::cipher::{self, CipherKey};
use crate::config::DEFAULT_CONNECT_TIMEOUT;
use crate::peer::{PeerContext, PeerLink, PeerUpdate};
use crate::presence::{Awareness, AwarenessEvent, AwarenessOrigin, DEFAULT_OUTDATED_TIMEOUT};
use crate::protocol::{Message, SyncMessage};
use crate::session::{RoomGuard, SyncNotifier};
use crate::signaling::{Envelope, PeerId, SignalingLink};
use crate::transport::{TransportEvent, TransportFactory};

/// Everything a room task reacts to.
#[derive(Debug)]
pub(crate) enum RoomEvent {
    /// A relay connection (re)opened; announce on it.
    SignalingConnected { url: Arc<str> },
    /// A signaling envelope arrived for this room.
    Envelope { url: Arc<str>, envelope: Envelope },
    /// A peer transport reported something.
    Transport {
        peer: PeerId,
        link_id: u64,
        event: TransportEvent,
    },
    /// A local document update to fan out.
    DocUpdate(Vec<u8>),
    Close,
}

pub(crate) struct Room {
    name: String,
    peer_id: PeerId,
    doc: Doc,
    awareness: Arc<Awareness>,
    origin: Origin,
    links: Vec<SignalingLink>,
    transport: Arc<dyn TransportFactory>,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    peers: HashMap<PeerId, PeerLink>,
    next_link_id: u64,
    /// Last aggregate value reported; `None` until the first report.
    synced: Option<bool>,
    notifier: SyncNotifier,
}

impl Room {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        peer_id: PeerId,
        doc: Doc,
        awareness: Arc<Awareness>,
        origin: Origin,
        links: Vec<SignalingLink>,
        transport: Arc<dyn TransportFactory>,
        events_tx: mpsc::UnboundedSender<RoomEvent>,
        notifier: SyncNotifier,
    ) -> Self {
        let mut room = Self {
            name,
            peer_id,
            doc,
            awareness,
            origin,
            links,
            transport,
            events_tx,
            peers: HashMap::new(),
            next_link_id: 0,
            synced: None,
            notifier,
        };
        room.recompute_synced();
        room
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn peer(&self, id: &str) -> Option<&PeerLink> {
        self.peers.get(id)
    }

    pub(crate) fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::SignalingConnected { url } => self.announce(&url, None),
            RoomEvent::Envelope { url, envelope } => self.handle_envelope(&url, envelope),
            RoomEvent::Transport { peer, link_id, event } => self.handle_transport(&peer, link_id, event),
            RoomEvent::DocUpdate(update) => self.on_doc_update(update),
            // The task loop intercepts Close before dispatching.
            RoomEvent::Close => {}
        }
    }

    fn announce(&self, url: &str, to: Option<PeerId>) {
        let envelope = Envelope::Announce {
            from: self.peer_id.clone(),
            to,
        };
        for link in self.links.iter().filter(|l| l.url() == url) {
            link.publish(&self.name, envelope.clone());
        }
    }

    /// Announce on every relay, so peers we lost a link to find us again.
    fn announce_everywhere(&self) {
        let envelope = Envelope::announce(self.peer_id.clone());
        for link in &self.links {
            link.publish(&self.name, envelope.clone());
        }
    }

    pub(crate) fn handle_envelope(&mut self, url: &str, envelope: Envelope) {
        let Some(from) = envelope.sender() else {
            return;
        };
        if from == self.peer_id {
            return;
        }
        if envelope.recipient().is_some_and(|to| to != self.peer_id) {
            return;
        }

        match envelope {
            Envelope::Announce { from, to } => {
                if self.peers.contains_key(&from) {
                    return;
                }
                if self.peer_id < from {
                    log::debug!("Room '{}': initiating link to {from}", self.name);
                    self.create_peer(from, true);
                } else if to.is_none() {
                    // The lower id initiates; tell it we exist.
                    self.announce(url, Some(from));
                }
            }
            Envelope::Signal { from, signal, .. } => {
                // A fresh offer for a responder that never connected means
                // the initiator gave up and started over.
                let restarted = self.peers.get(&from).is_some_and(|link| {
                    !link.is_initiator() && !link.is_connected() && link.is_new_offer(&signal)
                });
                if restarted {
                    log::debug!("Room '{}': {from} restarted its offer", self.name);
                    self.peers.remove(&from);
                }
                if !self.peers.contains_key(&from) {
                    log::debug!("Room '{}': accepting link from {from}", self.name);
                    self.create_peer(from.clone(), false);
                }
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.signal(signal);
                }
            }
            Envelope::Unknown => {}
        }
    }

    fn create_peer(&mut self, remote: PeerId, initiator: bool) {
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        let link = PeerLink::new(
            remote.clone(),
            link_id,
            initiator,
            self.transport.as_ref(),
            self.events_tx.clone(),
        );
        self.peers.insert(remote, link);
        self.recompute_synced();
    }

    fn handle_transport(&mut self, peer: &str, link_id: u64, event: TransportEvent) {
        let ctx = PeerContext {
            room: &self.name,
            local_peer: &self.peer_id,
            doc: &self.doc,
            awareness: &self.awareness,
            origin: &self.origin,
            links: &self.links,
        };
        let Some(link) = self.peers.get_mut(peer) else {
            return;
        };
        if link.link_id() != link_id {
            return;
        }

        let update = link.handle_event(&ctx, event);
        match update {
            PeerUpdate::None => {}
            PeerUpdate::Synced => self.recompute_synced(),
            PeerUpdate::Closed => {
                self.peers.remove(peer);
                self.recompute_synced();
            }
            PeerUpdate::Failed => {
                self.peers.remove(peer);
                self.recompute_synced();
                self.announce_everywhere();
            }
        }
    }

    /// Drop links that never connected. Called from the room's timer.
    pub(crate) fn drop_stalled_peers(&mut self, now: Instant) {
        let stalled: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, link)| link.is_stalled(now, DEFAULT_CONNECT_TIMEOUT))
            .map(|(id, _)| id.clone())
            .collect();
        if stalled.is_empty() {
            return;
        }
        for id in &stalled {
            log::info!("Room '{}': link to {id} never connected, dropping it", self.name);
            self.peers.remove(id);
        }
        self.recompute_synced();
        self.announce_everywhere();
    }

    /// Send to every connected peer.
    pub(crate) fn broadcast(&mut self, bytes: &[u8]) {
        for link in self.peers.values_mut().filter(|l| l.is_connected()) {
            link.send(bytes.to_vec());
        }
    }

    fn on_doc_update(&mut self, update: Vec<u8>) {
        let bytes = Message::Sync(SyncMessage::Update(update)).encode();
        self.broadcast(&bytes);
    }

    pub(crate) fn on_awareness_event(&mut self, event: AwarenessEvent) {
        if event.origin != AwarenessOrigin::Local {
            return;
        }
        let update = self.awareness.encode_update(&event.change.changed_clients());
        self.broadcast(&Message::Awareness(update).encode());
    }

    pub(crate) fn recompute_synced(&mut self) {
        let synced = self.peers.values().all(PeerLink::is_synced);
        if self.synced != Some(synced) {
            self.synced = Some(synced);
            log::debug!("Room '{}' synced: {synced}", self.name);
            self.notifier.notify(synced);
        }
    }

    /// Tell peers we are leaving and drop every link.
    pub(crate) fn shutdown(&mut self) {
        if self.awareness.local_state().is_some() {
            let removal = self.awareness.encode_local_removal();
            self.broadcast(&Message::Awareness(removal).encode());
        }
        for (_, mut link) in self.peers.drain() {
            link.close();
        }
        log::info!("Room '{}' closed", self.name);
    }
}

/// Inputs for one room task.
pub(crate) struct RoomTask {
    pub name: String,
    pub peer_id: PeerId,
    pub doc: Doc,
    pub awareness: Arc<Awareness>,
    pub origin: Origin,
    pub password: Option<String>,
    pub links: Vec<SignalingLink>,
    pub transport: Arc<dyn TransportFactory>,
    pub events_tx: mpsc::UnboundedSender<RoomEvent>,
    pub events_rx: mpsc::UnboundedReceiver<RoomEvent>,
    pub notifier: SyncNotifier,
    pub guard: RoomGuard,
}

/// Room task body: resolve the key, register with the relays, then serve
/// events until the session closes.
pub(crate) async fn run(task: RoomTask) {
    let RoomTask {
        name,
        peer_id,
        doc,
        awareness,
        origin,
        password,
        links,
        transport,
        events_tx,
        mut events_rx,
        notifier,
        guard,
    } = task;

    let key = match password {
        None => None,
        Some(password) => match resolve_key(password, &name, &mut events_rx).await {
            Some(Ok(key)) => Some(Arc::new(key)),
            Some(Err(e)) => {
                log::error!("Room '{name}': key derivation failed: {e}");
                drop(guard);
                return;
            }
            None => {
                log::debug!("Room '{name}' closed before its key was ready");
                drop(guard);
                return;
            }
        },
    };

    let mut awareness_rx = awareness.subscribe();
    let mut room = Room::new(
        name.clone(),
        peer_id,
        doc,
        awareness.clone(),
        origin,
        links.clone(),
        transport,
        events_tx.clone(),
        notifier,
    );
    for link in &links {
        link.register(&name, key.clone(), events_tx.clone());
    }
    log::info!("Room '{name}' open on {} relay(s)", links.len());

    let sweep_period = DEFAULT_OUTDATED_TIMEOUT / 10;
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + sweep_period, sweep_period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                None | Some(RoomEvent::Close) => break,
                Some(event) => room.handle_event(event),
            },
            Some(event) = awareness_rx.recv() => room.on_awareness_event(event),
            _ = sweep.tick() => {
                awareness.remove_outdated(DEFAULT_OUTDATED_TIMEOUT);
                room.drop_stalled_peers(Instant::now());
            }
        }
    }

    room.shutdown();
    drop(guard);
}

/// Derive the room key while watching for a close. Events that arrive in
/// the meantime are dropped; re-announcing after registration heals them.
///
/// `None` means the session closed. The derivation is still awaited so the
/// room name stays reserved until it finishes.
async fn resolve_key(
    password: String,
    name: &str,
    events_rx: &mut mpsc::UnboundedReceiver<RoomEvent>,
) -> Option<Result<CipherKey, cipher::CryptoError>> {
    let derive = cipher::derive_key_async(password, name.to_string());
    tokio::pin!(derive);
    loop {
        tokio::select! {
            key = &mut derive => return Some(key),
            event = events_rx.recv() => match event {
                None | Some(RoomEvent::Close) => {
                    let _ = derive.await;
                    return None;
                }
                Some(_) => {}
            },
        }
    }
}
