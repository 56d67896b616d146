//! Content-blind publish/subscribe signaling relay.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                      ┌── topic "notes" ── {A, B}
//!          ├── RelayServer ───────┤
//! Peer B ──┘   (one task / conn)  └── topic "todo"  ── {B}
//!
//! publish{topic, data} ──► every subscriber of topic (sender included)
//!                          with `clients` = number of receivers
//! ```
//!
//! The relay never opens `data`; keyed rooms publish opaque tokens.
//! Connections that stop answering websocket pings are dropped.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;

use crate::signaling::RelayMessage;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Websocket ping interval in seconds
    pub ping_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4444".to_string(),
            ping_interval_secs: 30,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_publishes: u64,
    pub active_topics: usize,
}

type Subscribers = HashMap<u64, mpsc::UnboundedSender<Arc<str>>>;
type Topics = Arc<RwLock<HashMap<String, Subscribers>>>;

/// The relay server. Clones share state.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    topics: Topics,
    stats: Arc<RwLock<RelayStats>>,
    next_conn_id: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            topics: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address. Use port 0 to pick a free one.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr).await {
                    log::debug!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("WebSocket connection {conn_id} established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Arc<str>>();
        let mut subscribed: HashSet<String> = HashSet::new();

        let period = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut alive = true;

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    alive = true;
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let reply = self
                                .handle_message(text.as_str(), conn_id, &outgoing_tx, &mut subscribed)
                                .await;
                            if let Some(reply) = reply {
                                if let Err(e) = ws_sender.send(Message::Text(reply.into())).await {
                                    break Err(e.into());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(e.into()),
                    }
                }

                Some(text) = outgoing_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Text(text.to_string().into())).await {
                        break Err(e.into());
                    }
                }

                _ = ping.tick() => {
                    if !alive {
                        log::debug!("Connection {conn_id} from {addr} timed out");
                        break Ok(());
                    }
                    alive = false;
                    if let Err(e) = ws_sender.send(Message::Ping(Default::default())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        // Cleanup: drop the connection from every topic it joined
        {
            let mut topics = self.topics.write().await;
            for topic in &subscribed {
                if let Some(subs) = topics.get_mut(topic) {
                    subs.remove(&conn_id);
                    if subs.is_empty() {
                        topics.remove(topic);
                    }
                }
            }
            let mut s = self.stats.write().await;
            s.active_connections -= 1;
            s.active_topics = topics.len();
        }
        log::debug!("Connection {conn_id} from {addr} closed");
        result
    }

    /// Apply one client message. Returns a direct reply, if any.
    async fn handle_message(
        &self,
        text: &str,
        conn_id: u64,
        outgoing: &mpsc::UnboundedSender<Arc<str>>,
        subscribed: &mut HashSet<String>,
    ) -> Option<String> {
        let msg = match RelayMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Ignoring message from connection {conn_id}: {e}");
                return None;
            }
        };

        match msg {
            RelayMessage::Subscribe { topics } => {
                let mut map = self.topics.write().await;
                for topic in topics {
                    map.entry(topic.clone())
                        .or_default()
                        .insert(conn_id, outgoing.clone());
                    subscribed.insert(topic);
                }
                self.stats.write().await.active_topics = map.len();
                None
            }
            RelayMessage::Unsubscribe { topics } => {
                let mut map = self.topics.write().await;
                for topic in topics {
                    if let Some(subs) = map.get_mut(&topic) {
                        subs.remove(&conn_id);
                        if subs.is_empty() {
                            map.remove(&topic);
                        }
                    }
                    subscribed.remove(&topic);
                }
                self.stats.write().await.active_topics = map.len();
                None
            }
            RelayMessage::Publish { topic, data, .. } => {
                let receivers: Vec<mpsc::UnboundedSender<Arc<str>>> = {
                    let map = self.topics.read().await;
                    map.get(&topic)
                        .map(|subs| subs.values().cloned().collect())
                        .unwrap_or_default()
                };
                self.stats.write().await.total_publishes += 1;
                if receivers.is_empty() {
                    return None;
                }

                let out = RelayMessage::Publish {
                    topic,
                    data,
                    clients: Some(receivers.len()),
                };
                match out.to_json() {
                    Ok(json) => {
                        let json: Arc<str> = Arc::from(json);
                        for rx in receivers {
                            let _ = rx.send(json.clone());
                        }
                    }
                    Err(e) => log::warn!("Failed to re-encode publish: {e}"),
                }
                None
            }
            RelayMessage::Ping => RelayMessage::Pong.to_json().ok(),
            RelayMessage::Pong | RelayMessage::Unknown => None,
        }
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Number of subscribers of `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().await.get(topic).map_or(0, HashMap::len)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:4444");
        assert_eq!(config.ping_interval_secs, 30);
    }

    #[tokio::test]
    async fn test_subscribe_publish_unsubscribe() {
        let relay = RelayServer::with_defaults();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut subs_a = HashSet::new();
        let mut subs_b = HashSet::new();

        relay
            .handle_message(r#"{"type":"subscribe","topics":["t"]}"#, 1, &tx_a, &mut subs_a)
            .await;
        relay
            .handle_message(r#"{"type":"subscribe","topics":["t","u"]}"#, 2, &tx_b, &mut subs_b)
            .await;
        assert_eq!(relay.subscriber_count("t").await, 2);

        let publish = json!({"type": "publish", "topic": "t", "data": {"x": 1}}).to_string();
        relay.handle_message(&publish, 1, &tx_a, &mut subs_a).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let got: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(got["clients"], 2);
            assert_eq!(got["data"], json!({"x": 1}));
        }

        relay
            .handle_message(r#"{"type":"unsubscribe","topics":["t"]}"#, 2, &tx_b, &mut subs_b)
            .await;
        relay.handle_message(&publish, 1, &tx_a, &mut subs_a).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(subs_b, HashSet::from(["u".to_string()]));
    }

    #[tokio::test]
    async fn test_publish_to_other_topic_not_delivered() {
        let relay = RelayServer::with_defaults();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subs = HashSet::new();
        relay
            .handle_message(r#"{"type":"subscribe","topics":["mine"]}"#, 1, &tx, &mut subs)
            .await;
        relay
            .handle_message(r#"{"type":"publish","topic":"theirs","data":"tok"}"#, 1, &tx, &mut subs)
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_gets_pong_and_garbage_ignored() {
        let relay = RelayServer::with_defaults();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut subs = HashSet::new();
        assert_eq!(
            relay.handle_message(r#"{"type":"ping"}"#, 1, &tx, &mut subs).await,
            Some(r#"{"type":"pong"}"#.to_string())
        );
        assert_eq!(relay.handle_message("nonsense", 1, &tx, &mut subs).await, None);
        assert_eq!(relay.handle_message(r#"{"type":"mystery"}"#, 1, &tx, &mut subs).await, None);
    }
}
