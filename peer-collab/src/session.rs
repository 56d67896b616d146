//! Public entry point: bind a document and its awareness to a room.
//!
//! ```text
//! CollabHub ── rooms: {name}            (one open session per name)
//!     │     └─ links: url → (SignalingLink, refs)
//!     │
//!     └─ open(name, doc, awareness, options) ──► CollabSession
//!                                                   │ doc observer ─► room task
//!                                                   └ events / synced ◄─ room task
//! ```
//!
//! The hub is the application-wide registry. Links are shared between the
//! sessions that name the same relay URL and shut down with their last user.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::{Doc, Origin, Subscription};

use crate::config::{LinkConfig, SessionOptions};
use crate::error::CollabError;
use crate::presence::Awareness;
use crate::room::{self, RoomEvent, RoomTask};
use crate::signaling::{ConnectionState, PeerId, SignalingLink};

/// Notifications delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The aggregate sync flag changed (or was reported for the first time).
    Synced { synced: bool },
}

/// Room-side end of the session's sync channels.
pub(crate) struct SyncNotifier {
    watch: watch::Sender<bool>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SyncNotifier {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>, watch::Receiver<bool>) {
        let (watch_tx, watch_rx) = watch::channel(false);
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                watch: watch_tx,
                events,
            },
            events_rx,
            watch_rx,
        )
    }

    pub(crate) fn notify(&self, synced: bool) {
        self.watch.send_replace(synced);
        let _ = self.events.send(SessionEvent::Synced { synced });
    }
}

struct LinkEntry {
    link: SignalingLink,
    refs: usize,
}

struct HubInner {
    config: LinkConfig,
    rooms: Mutex<HashSet<String>>,
    links: Mutex<HashMap<String, LinkEntry>>,
}

/// Registry of open rooms and shared relay links.
#[derive(Clone)]
pub struct CollabHub {
    inner: Arc<HubInner>,
}

impl Default for CollabHub {
    fn default() -> Self {
        Self::new()
    }
}

impl CollabHub {
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    pub fn with_config(config: LinkConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                rooms: Mutex::new(HashSet::new()),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, LinkEntry>> {
        self.inner.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start sharing `doc` and `awareness` in `room_name`.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`CollabError::RoomAlreadyOpen`] if this hub already has a session
    /// for the name. With a password, the room key is derived in the
    /// background; the session joins the relays once it is ready.
    pub fn open(
        &self,
        room_name: impl Into<String>,
        doc: Doc,
        awareness: Arc<Awareness>,
        options: SessionOptions,
    ) -> Result<CollabSession, CollabError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CollabError::Signaling(format!("no tokio runtime: {e}")))?;
        let name = room_name.into();

        if !self.rooms().insert(name.clone()) {
            return Err(CollabError::RoomAlreadyOpen(name));
        }

        let mut urls: Vec<String> = Vec::with_capacity(options.signaling_urls.len());
        for url in options.signaling_urls {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        let links: Vec<SignalingLink> = urls.iter().map(|url| self.acquire_link(url)).collect();
        // From here on, dropping the guard undoes the reservation.
        let guard = RoomGuard {
            hub: self.clone(),
            name: name.clone(),
            links: links.clone(),
        };

        let peer_id: PeerId = Uuid::new_v4().to_string();
        let origin = Origin::from(format!("peer-collab:{name}:{peer_id}").as_str());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let doc_subscription = {
            let tx = events_tx.clone();
            let own = origin.clone();
            doc.observe_update_v1(move |txn, event| {
                if txn.origin() != Some(&own) {
                    let _ = tx.send(RoomEvent::DocUpdate(event.update.clone()));
                }
            })
            .map_err(|e| CollabError::Document(format!("{e:?}")))?
        };

        let (notifier, session_events, synced) = SyncNotifier::channel();
        let task = runtime.spawn(room::run(RoomTask {
            name: name.clone(),
            peer_id: peer_id.clone(),
            doc: doc.clone(),
            awareness: awareness.clone(),
            origin,
            password: options.password,
            links,
            transport: options.transport,
            events_tx: events_tx.clone(),
            events_rx,
            notifier,
            guard,
        }));

        log::info!("Opened session for room '{name}' as {peer_id}");
        Ok(CollabSession {
            room_name: name,
            peer_id,
            doc,
            awareness,
            events_tx,
            event_rx: Some(session_events),
            synced,
            doc_subscription: Some(doc_subscription),
            task: Some(task),
        })
    }

    /// Whether a session currently holds `room_name`.
    pub fn is_open(&self, room_name: &str) -> bool {
        self.rooms().contains(room_name)
    }

    pub fn open_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms().iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Number of live relay links.
    pub fn link_count(&self) -> usize {
        self.links().len()
    }

    pub fn link_state(&self, url: &str) -> Option<ConnectionState> {
        self.links().get(url).map(|entry| entry.link.state())
    }

    fn acquire_link(&self, url: &str) -> SignalingLink {
        let mut links = self.links();
        let entry = links.entry(url.to_string()).or_insert_with(|| {
            log::debug!("Opening signaling link to {url}");
            LinkEntry {
                link: SignalingLink::spawn(url, self.inner.config.clone()),
                refs: 0,
            }
        });
        entry.refs += 1;
        entry.link.clone()
    }

    fn release_link(&self, url: &str) {
        let mut links = self.links();
        let Some(entry) = links.get_mut(url) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = links.remove(url) {
                log::debug!("Closing signaling link to {url}");
                entry.link.shutdown();
            }
        }
    }

    fn release_room(&self, name: &str) {
        self.rooms().remove(name);
    }
}

/// Owned by the room task. Dropping it detaches the room from its links
/// and frees the room name.
pub(crate) struct RoomGuard {
    hub: CollabHub,
    name: String,
    links: Vec<SignalingLink>,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        for link in &self.links {
            link.unregister(&self.name);
            self.hub.release_link(link.url());
        }
        self.hub.release_room(&self.name);
    }
}

/// A document shared in one room.
///
/// Closing (or dropping) the session leaves the room. Drop only requests
/// the shutdown; [`close`](Self::close) also waits for it.
pub struct CollabSession {
    room_name: String,
    peer_id: PeerId,
    doc: Doc,
    awareness: Arc<Awareness>,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    synced: watch::Receiver<bool>,
    doc_subscription: Option<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl CollabSession {
    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    /// Signaling address of this session.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    /// Take the event receiver (can only be called once).
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Watch the aggregate sync flag.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    fn request_close(&mut self) {
        // Stop feeding local edits before the room goes away.
        self.doc_subscription = None;
        let _ = self.events_tx.send(RoomEvent::Close);
    }

    /// Leave the room and wait until the room name is free again.
    pub async fn close(mut self) -> Result<(), CollabError> {
        self.request_close();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| CollabError::Signaling(format!("room task failed: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.request_close();
    }
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("room_name", &self.room_name)
            .field("peer_id", &self.peer_id)
            .field("synced", &*self.synced.borrow())
            .finish_non_exhaustive()
    }
}
