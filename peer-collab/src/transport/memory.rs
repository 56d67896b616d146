//! In-process transport.
//!
//! All transports created from one [`MemoryNetwork`] (and its clones) can
//! reach each other. The handshake mirrors an offer/answer exchange:
//!
//! ```text
//! initiator: register endpoint ──► Signal {"type":"offer","endpoint":id}
//! responder: signal(offer) ─► link both ends ─► Connect (remote, then local)
//!                           └► Signal {"type":"answer","endpoint":id}
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value};
use uuid::Uuid;

use super::{PeerTransport, TransportError, TransportEvent, TransportFactory, TransportSink};

struct Endpoint {
    id: String,
    sink: TransportSink,
    remote: Mutex<Option<Weak<Endpoint>>>,
    closed: AtomicBool,
}

impl Endpoint {
    fn remote(&self) -> Option<Arc<Endpoint>> {
        self.remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn set_remote(&self, remote: &Arc<Endpoint>) {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(remote));
    }
}

/// Shared in-memory "network" of pending endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<String, Arc<Endpoint>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, Arc<Endpoint>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of endpoints still waiting for or holding a connection.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints().len()
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, initiator: bool, sink: TransportSink) -> Box<dyn PeerTransport> {
        let endpoint = Arc::new(Endpoint {
            id: Uuid::new_v4().to_string(),
            sink,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.endpoints().insert(endpoint.id.clone(), endpoint.clone());

        if initiator {
            endpoint
                .sink
                .emit(TransportEvent::Signal(json!({"type": "offer", "endpoint": endpoint.id})));
        }

        Box::new(MemoryTransport {
            network: self.clone(),
            local: endpoint,
        })
    }
}

struct MemoryTransport {
    network: MemoryNetwork,
    local: Arc<Endpoint>,
}

impl MemoryTransport {
    fn accept_offer(&mut self, endpoint_id: &str) {
        if self.local.remote().is_some() {
            return;
        }
        let Some(remote) = self.network.endpoints().get(endpoint_id).cloned() else {
            self.local
                .sink
                .emit(TransportEvent::Error(format!("unknown endpoint {endpoint_id}")));
            return;
        };
        if remote.closed.load(Ordering::Acquire) {
            self.local
                .sink
                .emit(TransportEvent::Error(format!("endpoint {endpoint_id} closed")));
            return;
        }

        self.local.set_remote(&remote);
        remote.set_remote(&self.local);

        self.local
            .sink
            .emit(TransportEvent::Signal(json!({"type": "answer", "endpoint": self.local.id})));
        // Remote first, so its Connect is queued before any data we send.
        remote.sink.emit(TransportEvent::Connect);
        self.local.sink.emit(TransportEvent::Connect);
    }
}

impl PeerTransport for MemoryTransport {
    fn signal(&mut self, signal: Value) {
        let kind = signal.get("type").and_then(Value::as_str);
        let endpoint = signal.get("endpoint").and_then(Value::as_str);
        match (kind, endpoint) {
            (Some("offer"), Some(id)) => {
                let id = id.to_string();
                self.accept_offer(&id);
            }
            (Some("answer"), Some(_)) => {}
            _ => log::debug!("memory transport: ignoring signal {signal}"),
        }
    }

    fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.local.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let remote = self.local.remote().ok_or(TransportError::NotConnected)?;
        if remote.closed.load(Ordering::Acquire) || !remote.sink.emit(TransportEvent::Data(data)) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.local.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.network.endpoints().remove(&self.local.id);
        if let Some(remote) = self.local.remote() {
            if !remote.closed.load(Ordering::Acquire) {
                remote.sink.emit(TransportEvent::Close);
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomEvent;
    use tokio::sync::mpsc;

    fn sink(peer: &str) -> (TransportSink, mpsc::UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportSink::new(peer.into(), 1, tx), rx)
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) -> TransportEvent {
        match rx.try_recv().expect("expected an event") {
            RoomEvent::Transport { event, .. } => event,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn connected_pair(
        net: &MemoryNetwork,
    ) -> (
        Box<dyn PeerTransport>,
        mpsc::UnboundedReceiver<RoomEvent>,
        Box<dyn PeerTransport>,
        mpsc::UnboundedReceiver<RoomEvent>,
    ) {
        let (a_sink, mut a_rx) = sink("b");
        let (b_sink, mut b_rx) = sink("a");
        let a = net.create(true, a_sink);
        let mut b = net.create(false, b_sink);

        let TransportEvent::Signal(offer) = next_event(&mut a_rx) else {
            panic!("initiator must emit an offer");
        };
        b.signal(offer);

        assert!(matches!(next_event(&mut b_rx), TransportEvent::Signal(_)));
        assert_eq!(next_event(&mut a_rx), TransportEvent::Connect);
        assert_eq!(next_event(&mut b_rx), TransportEvent::Connect);
        (a, a_rx, b, b_rx)
    }

    #[test]
    fn test_handshake_and_data() {
        let net = MemoryNetwork::new();
        let (mut a, mut a_rx, mut b, mut b_rx) = connected_pair(&net);

        a.send(vec![1, 2, 3]).unwrap();
        b.send(vec![4]).unwrap();

        assert_eq!(next_event(&mut b_rx), TransportEvent::Data(vec![1, 2, 3]));
        assert_eq!(next_event(&mut a_rx), TransportEvent::Data(vec![4]));
    }

    #[test]
    fn test_close_notifies_remote() {
        let net = MemoryNetwork::new();
        let (mut a, _a_rx, mut b, mut b_rx) = connected_pair(&net);

        a.close();
        assert_eq!(next_event(&mut b_rx), TransportEvent::Close);
        assert_eq!(a.send(vec![1]), Err(TransportError::Closed));
        assert!(b.send(vec![1]).is_err());
    }

    #[test]
    fn test_drop_closes() {
        let net = MemoryNetwork::new();
        let (a, _a_rx, _b, mut b_rx) = connected_pair(&net);
        drop(a);
        assert_eq!(next_event(&mut b_rx), TransportEvent::Close);
        assert_eq!(net.endpoint_count(), 1);
    }

    #[test]
    fn test_unknown_endpoint_is_an_error() {
        let net = MemoryNetwork::new();
        let (b_sink, mut b_rx) = sink("a");
        let mut b = net.create(false, b_sink);
        b.signal(json!({"type": "offer", "endpoint": "nope"}));
        assert!(matches!(next_event(&mut b_rx), TransportEvent::Error(_)));
    }

    #[test]
    fn test_send_before_connect() {
        let net = MemoryNetwork::new();
        let (a_sink, _a_rx) = sink("b");
        let mut a = net.create(true, a_sink);
        assert_eq!(a.send(vec![1]), Err(TransportError::NotConnected));
    }
}
