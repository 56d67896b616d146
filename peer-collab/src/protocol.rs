//! Binary data-channel protocol spoken between two peer links.
//!
//! Wire format (lib0 variable-length integers):
//! ```text
//! ┌──────────────────┬──────────────────────────────────────────┐
//! │ varuint msg_type │ payload                                  │
//! ├──────────────────┼──────────────────────────────────────────┤
//! │ 0 = Sync         │ varuint sync_type • varbytes(body)       │
//! │                  │   0 = step-1 (state vector)              │
//! │                  │   1 = step-2 (missing updates)           │
//! │                  │   2 = update (incremental)               │
//! │ 1 = Awareness    │ varbytes(awareness update)               │
//! │ 3 = QueryAwareness │ (empty)                                │
//! └──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The layout matches the Yjs sync and awareness protocols, so a `yrs`
//! replica can talk to any other Yjs peer over the same channel.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Top-level message discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Document sync (step-1, step-2 or update)
    Sync = 0,
    /// Presence/awareness update
    Awareness = 1,
    /// Request for a full awareness snapshot
    QueryAwareness = 3,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            3 => Some(Self::QueryAwareness),
            _ => None,
        }
    }
}

/// Sync sub-protocol discriminants.
pub const SYNC_STEP1: u32 = 0;
pub const SYNC_STEP2: u32 = 1;
pub const SYNC_UPDATE: u32 = 2;

/// Document sync sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender.
    SyncStep1(Vec<u8>),
    /// Update containing everything the step-1 sender was missing.
    SyncStep2(Vec<u8>),
    /// Incremental update from a local edit.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn tag(&self) -> u32 {
        match self {
            SyncMessage::SyncStep1(_) => SYNC_STEP1,
            SyncMessage::SyncStep2(_) => SYNC_STEP2,
            SyncMessage::Update(_) => SYNC_UPDATE,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1(b) | SyncMessage::SyncStep2(b) | SyncMessage::Update(b) => b,
        }
    }
}

/// A data-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    QueryAwareness,
    /// A discriminant this version does not understand. Kept so the
    /// caller can log it and move on.
    Unknown(u32),
}

impl Message {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Sync(sync) => {
                buf.write_var(MessageType::Sync as u32);
                buf.write_var(sync.tag());
                buf.write_buf(sync.body());
            }
            Message::Awareness(update) => {
                buf.write_var(MessageType::Awareness as u32);
                buf.write_buf(update);
            }
            Message::QueryAwareness => {
                buf.write_var(MessageType::QueryAwareness as u32);
            }
            Message::Unknown(tag) => {
                buf.write_var(*tag);
            }
        }
        buf
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var()?;
        let msg = match MessageType::from_tag(tag) {
            Some(MessageType::Sync) => {
                let sync_tag: u32 = cursor.read_var()?;
                let body = cursor.read_buf()?.to_vec();
                match sync_tag {
                    SYNC_STEP1 => Message::Sync(SyncMessage::SyncStep1(body)),
                    SYNC_STEP2 => Message::Sync(SyncMessage::SyncStep2(body)),
                    SYNC_UPDATE => Message::Sync(SyncMessage::Update(body)),
                    other => return Err(ProtocolError::UnknownSyncMessage(other)),
                }
            }
            Some(MessageType::Awareness) => Message::Awareness(cursor.read_buf()?.to_vec()),
            Some(MessageType::QueryAwareness) => Message::QueryAwareness,
            None => Message::Unknown(tag),
        };
        Ok(msg)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Message::Sync(_) => Some(MessageType::Sync),
            Message::Awareness(_) => Some(MessageType::Awareness),
            Message::QueryAwareness => Some(MessageType::QueryAwareness),
            Message::Unknown(_) => None,
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown sync message type: {0}")]
    UnknownSyncMessage(u32),

    #[error("Invalid relay message: {0}")]
    InvalidRelayMessage(String),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
