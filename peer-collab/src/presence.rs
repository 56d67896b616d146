//! Ephemeral presence (awareness) state shared alongside a document.
//!
//! Every client owns one JSON state (cursor, name, colour, ...) and a
//! monotonically increasing clock. Updates carry `(client, clock, state)`
//! triples; the higher clock wins and a `null` state means "gone".
//!
//! Wire format of an awareness update:
//! ```text
//! varuint(n) • n × ( varuint(client_id) • varuint(clock) • varstring(JSON state) )
//! ```
//!
//! Nothing here is persisted. Remote entries that stop being refreshed
//! expire after [`DEFAULT_OUTDATED_TIMEOUT`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::Doc;

use crate::error::CollabError;
use crate::protocol::ProtocolError;

/// Awareness client identifier (the document's client id).
pub type ClientId = u64;

/// Remote states not refreshed within this window are dropped.
pub const DEFAULT_OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

/// Who caused an awareness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessOrigin {
    /// This process changed its own state.
    Local,
    /// Applied from a peer. Never re-broadcast.
    Remote,
    /// Expired by the outdated-state sweep.
    Timeout,
}

/// Client ids touched by one change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched ids, in added → updated → removed order.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEvent {
    pub change: AwarenessChange,
    pub origin: AwarenessOrigin,
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u32,
    last_updated: Instant,
}

impl ClientMeta {
    fn new(clock: u32) -> Self {
        Self {
            clock,
            last_updated: Instant::now(),
        }
    }
}

struct AwarenessInner {
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
    subscribers: Vec<mpsc::UnboundedSender<AwarenessEvent>>,
}

/// Presence store for one local client.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Awareness {
    client_id: ClientId,
    inner: Mutex<AwarenessInner>,
}

impl Awareness {
    /// Create a store for the given local client id.
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            inner: Mutex::new(AwarenessInner {
                states: HashMap::new(),
                meta: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Create a store keyed by the document's client id.
    pub fn for_doc(doc: &Doc) -> Self {
        Self::new(doc.client_id())
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn lock(&self) -> MutexGuard<'_, AwarenessInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to change events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AwarenessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    fn emit(inner: &mut AwarenessInner, change: AwarenessChange, origin: AwarenessOrigin) {
        if change.is_empty() {
            return;
        }
        let event = AwarenessEvent { change, origin };
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Current local state, if any.
    pub fn local_state(&self) -> Option<Value> {
        self.lock().states.get(&self.client_id).cloned()
    }

    /// Replace the local state. `None` marks the local client as gone.
    pub fn set_local_state(&self, state: Option<Value>) {
        let mut inner = self.lock();
        let id = self.client_id;
        // Clock 0 belongs to "never set"; the first real state is 1.
        let clock = inner.meta.get(&id).map_or(1, |m| m.clock + 1);
        let prev_state = match state {
            Some(ref s) => inner.states.insert(id, s.clone()),
            None => inner.states.remove(&id),
        };
        inner.meta.insert(id, ClientMeta::new(clock));

        let mut change = AwarenessChange::default();
        match (&state, &prev_state) {
            (None, Some(_)) => change.removed.push(id),
            (Some(_), None) => change.added.push(id),
            (Some(new), Some(old)) if new != old => change.updated.push(id),
            // A refresh with an unchanged state still has to reach peers.
            (Some(_), Some(_)) => change.updated.push(id),
            (None, None) => {}
        }
        Self::emit(&mut inner, change, AwarenessOrigin::Local);
    }

    /// Snapshot of every known state.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.lock().states.clone()
    }

    /// Ids of every client with a live state.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.lock().states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Encode the given clients' states (missing ones as `null`).
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let inner = self.lock();
        let mut buf = Vec::new();
        let known: Vec<(ClientId, u32)> = clients
            .iter()
            .filter_map(|id| inner.meta.get(id).map(|m| (*id, m.clock)))
            .collect();

        buf.write_var(known.len() as u32);
        for (id, clock) in known {
            let json = inner
                .states
                .get(&id)
                .map_or_else(|| "null".to_string(), Value::to_string);
            buf.write_var(id);
            buf.write_var(clock);
            buf.write_string(&json);
        }
        buf
    }

    /// Encode a removal of the local client without touching the local
    /// state, so peers drop our presence when we leave.
    ///
    /// The local clock is advanced past the removal so the next snapshot
    /// we send overrides it.
    pub fn encode_local_removal(&self) -> Vec<u8> {
        let mut inner = self.lock();
        let id = self.client_id;
        let clock = inner.meta.get(&id).map_or(0, |m| m.clock + 1);
        inner.meta.insert(id, ClientMeta::new(clock + 1));

        let mut buf = Vec::new();
        buf.write_var(1u32);
        buf.write_var(id);
        buf.write_var(clock);
        buf.write_string("null");
        buf
    }

    /// Apply an encoded update from `origin`.
    pub fn apply_update(&self, update: &[u8], origin: AwarenessOrigin) -> Result<AwarenessChange, CollabError> {
        let entries = decode_update(update)?;
        let mut inner = self.lock();
        let mut change = AwarenessChange::default();

        for (id, mut clock, state) in entries {
            let prev_meta = inner.meta.get(&id).copied();
            let known = inner.states.contains_key(&id);

            let accept = match prev_meta {
                // First sighting of this client: any clock is news.
                None => state.is_some(),
                Some(m) => m.clock < clock || (m.clock == clock && state.is_none() && known),
            };
            if !accept {
                continue;
            }

            let prev_state = inner.states.get(&id).cloned();
            match state {
                None => {
                    if id == self.client_id && prev_state.is_some() {
                        // Nobody else may remove our own state; re-assert it.
                        clock += 1;
                    } else {
                        inner.states.remove(&id);
                    }
                }
                Some(ref s) => {
                    inner.states.insert(id, s.clone());
                }
            }
            inner.meta.insert(id, ClientMeta::new(clock));

            match (&prev_state, &state) {
                (None, Some(_)) => change.added.push(id),
                (Some(_), None) if id == self.client_id => change.updated.push(id),
                (Some(_), None) => change.removed.push(id),
                (Some(old), Some(new)) => {
                    if old != new {
                        change.updated.push(id);
                    }
                }
                (None, None) => {}
            }
        }

        Self::emit(&mut inner, change.clone(), origin);
        Ok(change)
    }

    /// Remove the given clients' states.
    pub fn remove_states(&self, clients: &[ClientId], origin: AwarenessOrigin) -> AwarenessChange {
        let mut inner = self.lock();
        let mut change = AwarenessChange::default();
        for id in clients {
            if inner.states.remove(id).is_some() {
                if *id == self.client_id {
                    let clock = inner.meta.get(id).map_or(0, |m| m.clock + 1);
                    inner.meta.insert(*id, ClientMeta::new(clock));
                }
                change.removed.push(*id);
            }
        }
        Self::emit(&mut inner, change.clone(), origin);
        change
    }

    /// Drop remote states older than `timeout` and renew the local state
    /// once it is half that old.
    pub fn remove_outdated(&self, timeout: Duration) -> AwarenessChange {
        let renew_local = {
            let inner = self.lock();
            inner.states.contains_key(&self.client_id)
                && inner
                    .meta
                    .get(&self.client_id)
                    .is_some_and(|m| m.last_updated.elapsed() >= timeout / 2)
        };
        if renew_local {
            self.set_local_state(self.local_state());
        }

        let mut inner = self.lock();
        let expired: Vec<ClientId> = inner
            .meta
            .iter()
            .filter(|(id, m)| {
                **id != self.client_id && m.last_updated.elapsed() >= timeout
            })
            .map(|(id, _)| *id)
            .filter(|id| inner.states.contains_key(id))
            .collect();

        let mut change = AwarenessChange::default();
        for id in expired {
            inner.states.remove(&id);
            change.removed.push(id);
        }
        Self::emit(&mut inner, change.clone(), AwarenessOrigin::Timeout);
        change
    }
}

/// Decode an awareness update into `(client, clock, state)` entries.
/// A `null` state decodes to `None`.
pub fn decode_update(update: &[u8]) -> Result<Vec<(ClientId, u32, Option<Value>)>, ProtocolError> {
    let mut cursor = Cursor::new(update);
    let len: u32 = cursor.read_var()?;
    let mut entries = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        let id: ClientId = cursor.read_var()?;
        let clock: u32 = cursor.read_var()?;
        let json = cursor.read_string()?;
        let state: Value = serde_json::from_str(json)
            .map_err(|e| ProtocolError::Malformed(format!("awareness state: {e}")))?;
        let state = if state.is_null() { None } else { Some(state) };
        entries.push((id, clock, state));
    }
    Ok(entries)
}
