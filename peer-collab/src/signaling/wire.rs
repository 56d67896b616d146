//! JSON messages exchanged with the signaling relay.
//!
//! ```text
//! {"type":"subscribe","topics":["room"]}
//! {"type":"unsubscribe","topics":["room"]}
//! {"type":"publish","topic":"room","data":<Envelope | cipher token>}
//! {"type":"ping"} / {"type":"pong"}
//! ```
//!
//! The relay only looks at the outer [`RelayMessage`]. The inner
//! [`Envelope`] is read by rooms, and is replaced by an opaque token
//! string when the room is password protected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ProtocolError;

/// Process-local address of a room participant on the signaling bus.
pub type PeerId = String;

/// Relay-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Publish {
        topic: String,
        data: Value,
        /// Number of subscribers the relay delivered to. Set by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clients: Option<usize>,
    },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    pub fn publish(topic: impl Into<String>, data: Value) -> Self {
        RelayMessage::Publish {
            topic: topic.into(),
            data,
            clients: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidRelayMessage(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidRelayMessage(e.to_string()))
    }
}

/// Room-level signaling envelope carried in `publish.data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// "I am in this room." A targeted announce (`to` set) is the reply a
    /// higher peer id sends so the lower one initiates.
    Announce {
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    /// Opaque transport handshake payload for one remote peer.
    Signal {
        from: PeerId,
        to: PeerId,
        signal: Value,
    },
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn announce(from: impl Into<PeerId>) -> Self {
        Envelope::Announce {
            from: from.into(),
            to: None,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            Envelope::Announce { from, .. } | Envelope::Signal { from, .. } => Some(from.as_str()),
            Envelope::Unknown => None,
        }
    }

    pub fn recipient(&self) -> Option<&str> {
        match self {
            Envelope::Announce { to, .. } => to.as_deref(),
            Envelope::Signal { to, .. } => Some(to.as_str()),
            Envelope::Unknown => None,
        }
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::InvalidRelayMessage(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidRelayMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_wire_format() {
        let msg = RelayMessage::Subscribe {
            topics: vec!["demo".into()],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "subscribe", "topics": ["demo"]}));
    }

    #[test]
    fn test_publish_omits_clients() {
        let msg = RelayMessage::publish("demo", json!({"type": "announce", "from": "a"}));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "publish", "topic": "demo", "data": {"type": "announce", "from": "a"}})
        );
    }

    #[test]
    fn test_parse_relay_publish_with_clients() {
        let msg = RelayMessage::parse(r#"{"type":"publish","topic":"t","data":"tok","clients":3}"#)
            .unwrap();
        assert_eq!(
            msg,
            RelayMessage::Publish {
                topic: "t".into(),
                data: json!("tok"),
                clients: Some(3)
            }
        );
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(RelayMessage::parse(r#"{"type":"ping"}"#).unwrap(), RelayMessage::Ping);
        assert_eq!(RelayMessage::Pong.to_json().unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_unknown_relay_type() {
        assert_eq!(
            RelayMessage::parse(r#"{"type":"whatever","x":1}"#).unwrap(),
            RelayMessage::Unknown
        );
        assert!(RelayMessage::parse("not json").is_err());
    }

    #[test]
    fn test_envelope_announce() {
        let env = Envelope::from_value(json!({"type": "announce", "from": "p1"})).unwrap();
        assert_eq!(env, Envelope::announce("p1"));
        assert_eq!(env.sender(), Some("p1"));
        assert_eq!(env.recipient(), None);
        assert_eq!(env.to_value().unwrap(), json!({"type": "announce", "from": "p1"}));
    }

    #[test]
    fn test_envelope_signal() {
        let value = json!({"type": "signal", "from": "p1", "to": "p2", "signal": {"sdp": "x"}});
        let env = Envelope::from_value(value.clone()).unwrap();
        assert_eq!(env.sender(), Some("p1"));
        assert_eq!(env.recipient(), Some("p2"));
        assert_eq!(env.to_value().unwrap(), value);
    }

    #[test]
    fn test_envelope_missing_fields() {
        assert!(Envelope::from_value(json!({"type": "signal", "from": "p1"})).is_err());
        assert_eq!(
            Envelope::from_value(json!({"type": "hello"})).unwrap(),
            Envelope::Unknown
        );
    }
}
