//! Persistent, auto-reconnecting WebSocket connection to one relay.
//!
//! ```text
//!  Room A ─┐  LinkCommand            ┌──────────────┐   ws text frames
//!  Room B ─┼────────────────────────►│  link task   │◄─────────────────► relay
//!  Room C ─┘ ◄── RoomEvent::Envelope │ topic → reg  │
//!             ◄─ SignalingConnected  └──────────────┘
//! ```
//!
//! One task per relay URL. Rooms register a topic (their name) and an
//! optional cipher key; the task subscribes, re-subscribes after every
//! reconnect, wraps outbound envelopes and unwraps inbound ones.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::cipher::{self, CipherKey};
use crate::config::LinkConfig;
use crate::room::RoomEvent;

use super::wire::{Envelope, RelayMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) enum LinkCommand {
    Register {
        topic: String,
        key: Option<Arc<CipherKey>>,
        events: mpsc::UnboundedSender<RoomEvent>,
    },
    Unregister {
        topic: String,
    },
    Publish {
        topic: String,
        envelope: Envelope,
    },
    Shutdown,
}

/// Handle to a relay connection. Cheap to clone.
#[derive(Clone)]
pub struct SignalingLink {
    url: Arc<str>,
    commands: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for SignalingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingLink")
            .field("url", &self.url)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SignalingLink {
    /// Start the link task. Must be called inside a tokio runtime.
    pub fn spawn(url: impl Into<String>, config: LinkConfig) -> Self {
        let url: Arc<str> = Arc::from(url.into());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let task = LinkTask {
            url: url.clone(),
            config,
            commands: commands_rx,
            state: state_tx,
            rooms: HashMap::new(),
        };
        tokio::spawn(task.run());

        Self { url, commands, state }
    }

    /// A handle with no task behind it; commands land on the returned
    /// receiver. Used to drive rooms directly in tests.
    #[cfg(test)]
    pub(crate) fn from_parts(url: &str) -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (_, state) = watch::channel(ConnectionState::Connected);
        (
            Self {
                url: Arc::from(url),
                commands,
                state,
            },
            rx,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub(crate) fn register(
        &self,
        topic: &str,
        key: Option<Arc<CipherKey>>,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) {
        let _ = self.commands.send(LinkCommand::Register {
            topic: topic.to_string(),
            key,
            events,
        });
    }

    pub(crate) fn unregister(&self, topic: &str) {
        let _ = self.commands.send(LinkCommand::Unregister {
            topic: topic.to_string(),
        });
    }

    /// Publish an envelope to a registered topic. Dropped while offline.
    pub(crate) fn publish(&self, topic: &str, envelope: Envelope) {
        let _ = self.commands.send(LinkCommand::Publish {
            topic: topic.to_string(),
            envelope,
        });
    }

    /// Close the connection and stop reconnecting.
    pub fn shutdown(&self) {
        let _ = self.commands.send(LinkCommand::Shutdown);
    }
}

struct Registration {
    key: Option<Arc<CipherKey>>,
    events: mpsc::UnboundedSender<RoomEvent>,
}

/// Why a connected session ended.
enum Disconnect {
    Lost,
    Shutdown,
}

struct LinkTask {
    url: Arc<str>,
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    state: watch::Sender<ConnectionState>,
    rooms: HashMap<String, Registration>,
}

impl LinkTask {
    async fn run(mut self) {
        let mut backoff = self.config.initial_backoff;

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let url = self.url.to_string();
            let connected = match self.while_offline(tokio_tungstenite::connect_async(url)).await {
                None => break,
                Some(result) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    log::info!("Signaling link connected to {}", self.url);
                    backoff = self.config.initial_backoff;
                    self.state.send_replace(ConnectionState::Connected);
                    let outcome = self.run_connected(ws).await;
                    self.state.send_replace(ConnectionState::Disconnected);
                    if let Disconnect::Shutdown = outcome {
                        break;
                    }
                    log::info!("Signaling link to {} lost, reconnecting", self.url);
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    log::info!("Signaling link to {} failed: {e}; retrying in {backoff:?}", self.url);
                }
            }

            if self.while_offline(tokio::time::sleep(backoff)).await.is_none() {
                break;
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        self.state.send_replace(ConnectionState::Disconnected);
        log::debug!("Signaling link to {} shut down", self.url);
    }

    /// Drive `fut` to completion while still serving commands.
    /// `None` means a shutdown was requested.
    async fn while_offline<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Some(out),
                cmd = self.commands.recv() => match cmd {
                    None | Some(LinkCommand::Shutdown) => return None,
                    Some(LinkCommand::Register { topic, key, events }) => {
                        self.rooms.insert(topic, Registration { key, events });
                    }
                    Some(LinkCommand::Unregister { topic }) => {
                        self.rooms.remove(&topic);
                    }
                    Some(LinkCommand::Publish { topic, .. }) => {
                        log::debug!("Dropping publish to '{topic}' on {}: not connected", self.url);
                    }
                },
            }
        }
    }

    async fn run_connected(&mut self, ws: WsStream) -> Disconnect {
        let (mut sink, mut stream) = ws.split();

        if !self.rooms.is_empty() {
            let topics: Vec<String> = self.rooms.keys().cloned().collect();
            if !send_relay(&mut sink, &RelayMessage::Subscribe { topics }).await {
                return Disconnect::Lost;
            }
        }
        for reg in self.rooms.values() {
            let _ = reg.events.send(RoomEvent::SignalingConnected { url: self.url.clone() });
        }

        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(LinkCommand::Shutdown) => {
                        let _ = sink.close().await;
                        return Disconnect::Shutdown;
                    }
                    Some(LinkCommand::Register { topic, key, events }) => {
                        let subscribe = RelayMessage::Subscribe { topics: vec![topic.clone()] };
                        let _ = events.send(RoomEvent::SignalingConnected { url: self.url.clone() });
                        self.rooms.insert(topic, Registration { key, events });
                        if !send_relay(&mut sink, &subscribe).await {
                            return Disconnect::Lost;
                        }
                    }
                    Some(LinkCommand::Unregister { topic }) => {
                        if self.rooms.remove(&topic).is_some() {
                            let unsubscribe = RelayMessage::Unsubscribe { topics: vec![topic] };
                            if !send_relay(&mut sink, &unsubscribe).await {
                                return Disconnect::Lost;
                            }
                        }
                    }
                    Some(LinkCommand::Publish { topic, envelope }) => {
                        let Some(msg) = self.wrap(&topic, &envelope) else {
                            continue;
                        };
                        if !send_relay(&mut sink, &msg).await {
                            return Disconnect::Lost;
                        }
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        awaiting_pong = false;
                        match RelayMessage::parse(text.as_str()) {
                            Ok(RelayMessage::Ping) => {
                                if !send_relay(&mut sink, &RelayMessage::Pong).await {
                                    return Disconnect::Lost;
                                }
                            }
                            Ok(RelayMessage::Publish { topic, data, .. }) => self.dispatch(&topic, data),
                            Ok(_) => {}
                            Err(e) => log::debug!("Ignoring relay message from {}: {e}", self.url),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Disconnect::Lost,
                    Some(Ok(_)) => awaiting_pong = false,
                    Some(Err(e)) => {
                        log::info!("Signaling link to {} errored: {e}", self.url);
                        return Disconnect::Lost;
                    }
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        log::info!("No pong from {} within {period:?}", self.url);
                        return Disconnect::Lost;
                    }
                    if !send_relay(&mut sink, &RelayMessage::Ping).await {
                        return Disconnect::Lost;
                    }
                    awaiting_pong = true;
                }
            }
        }
    }

    /// Build the outbound publish, sealing the envelope if the topic is keyed.
    fn wrap(&self, topic: &str, envelope: &Envelope) -> Option<RelayMessage> {
        let Some(reg) = self.rooms.get(topic) else {
            log::debug!("Dropping publish to unregistered topic '{topic}'");
            return None;
        };
        let value = match envelope.to_value() {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to serialize envelope for '{topic}': {e}");
                return None;
            }
        };
        let data = match &reg.key {
            Some(key) => match cipher::encrypt(key, &value) {
                Ok(token) => Value::String(token),
                Err(e) => {
                    log::warn!("Failed to encrypt envelope for '{topic}': {e}");
                    return None;
                }
            },
            None => value,
        };
        Some(RelayMessage::publish(topic, data))
    }

    /// Unwrap an inbound publish and hand it to the owning room.
    fn dispatch(&mut self, topic: &str, data: Value) {
        let Some(reg) = self.rooms.get(topic) else {
            return;
        };
        let value = match &reg.key {
            Some(key) => {
                let Some(token) = data.as_str() else {
                    log::debug!("Expected an encrypted token on '{topic}'");
                    return;
                };
                match cipher::decrypt(key, token) {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("Discarding undecryptable message on '{topic}': {e}");
                        return;
                    }
                }
            }
            None => data,
        };
        let envelope = match Envelope::from_value(value) {
            Ok(Envelope::Unknown) => return,
            Ok(env) => env,
            Err(e) => {
                log::debug!("Discarding malformed envelope on '{topic}': {e}");
                return;
            }
        };
        let delivered = reg
            .events
            .send(RoomEvent::Envelope {
                url: self.url.clone(),
                envelope,
            })
            .is_ok();
        if !delivered {
            self.rooms.remove(topic);
        }
    }
}

async fn send_relay<S>(sink: &mut S, msg: &RelayMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(e) => {
            log::warn!("Failed to encode relay message: {e}");
            return true;
        }
    };
    sink.send(Message::Text(json.into())).await.is_ok()
}
