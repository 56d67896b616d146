//! Shared fixtures: a relay on a free port and two-sided room clients.

#![allow(dead_code)]

use std::sync::Arc;

use peer_collab::{
    Awareness, CollabHub, CollabSession, LinkConfig, MemoryNetwork, RelayConfig, RelayServer,
    SessionOptions,
};
use tokio::time::{sleep, Duration, Instant};
use yrs::{Doc, GetString, Text, Transact};

/// Start a relay on 127.0.0.1 with an OS-assigned port; returns its ws:// URL.
pub async fn start_relay() -> String {
    let relay = RelayServer::new(RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..RelayConfig::default()
    });
    let listener = relay.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = relay.serve(listener).await;
    });
    format!("ws://{addr}")
}

pub fn fast_links() -> LinkConfig {
    LinkConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        ..LinkConfig::default()
    }
}

/// One participant: its own hub, document and awareness.
pub struct Client {
    pub hub: CollabHub,
    pub doc: Doc,
    pub awareness: Arc<Awareness>,
}

impl Client {
    pub fn new() -> Self {
        let doc = Doc::new();
        Self {
            hub: CollabHub::with_config(fast_links()),
            awareness: Arc::new(Awareness::for_doc(&doc)),
            doc,
        }
    }

    pub fn join(&self, room: &str, relay: &str, net: &MemoryNetwork, password: Option<&str>) -> CollabSession {
        let mut options = SessionOptions::new()
            .with_signaling_urls([relay])
            .with_transport(net.clone());
        if let Some(password) = password {
            options = options.with_password(password);
        }
        self.hub
            .open(room, self.doc.clone(), self.awareness.clone(), options)
            .unwrap()
    }

    pub fn text(&self) -> String {
        let text = self.doc.get_or_insert_text("content");
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    pub fn push(&self, chunk: &str) {
        let text = self.doc.get_or_insert_text("content");
        let mut txn = self.doc.transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, chunk);
    }
}

/// Poll `check` until it holds or `secs` elapse.
pub async fn eventually(what: &str, secs: u64, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}
