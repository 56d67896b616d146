//! # peer-collab — Peer-to-peer real-time collaboration
//!
//! Clients that open the same room name find each other through a
//! publish/subscribe relay, build direct peer links, and keep a shared
//! `yrs` document and presence state convergent.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!   ┌───────────────►│ RelayServer  │◄───────────────┐
//!   │  announce /    │ (pub / sub)  │   announce /   │
//!   │  signal (JSON) └──────────────┘   signal       │
//!   │                                                │
//! ┌─┴─────────────┐                          ┌───────┴───────┐
//! │ SignalingLink │                          │ SignalingLink │
//! └─┬─────────────┘                          └───────┬───────┘
//!   │ Cipher (optional)                              │
//! ┌─┴─────────────┐   PeerTransport (binary)  ┌──────┴────────┐
//! │ Room          │◄─────────────────────────►│ Room          │
//! │  └ PeerLink×N │   sync / awareness        │  └ PeerLink×N │
//! └─┬─────────────┘                           └──────┬────────┘
//!   │                                                │
//! ┌─┴─────────────┐                          ┌───────┴───────┐
//! │ Yrs Doc       │                          │ Yrs Doc       │
//! │ Awareness     │                          │ Awareness     │
//! └───────────────┘                          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — `CollabHub` registry and `CollabSession` facade
//! - `room` — per-room event loop, announce tie-break, sync aggregate
//! - [`peer`] — one peer link: sync and awareness over a transport
//! - [`signaling`] — relay connection and JSON wire types
//! - [`transport`] — transport seam, in-memory and TCP transports
//! - [`protocol`] — binary data-channel codec
//! - [`sync`] — document step-1 / step-2 / update handling
//! - [`presence`] — awareness store
//! - [`cipher`] — password-derived envelope encryption
//! - [`relay`] — the signaling relay server
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peer_collab::{Awareness, CollabHub, SessionOptions};
//!
//! # async fn demo() -> Result<(), peer_collab::CollabError> {
//! let hub = CollabHub::new();
//! let doc = yrs::Doc::new();
//! let awareness = Arc::new(Awareness::for_doc(&doc));
//! let options = SessionOptions::new()
//!     .with_signaling_urls(["ws://127.0.0.1:4444"])
//!     .with_password("correct horse");
//!
//! let mut session = hub.open("notes", doc, awareness, options)?;
//! let mut events = session.events().expect("first call");
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! session.close().await
//! # }
//! ```

pub mod cipher;
pub mod config;
pub mod error;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod relay;
mod room;
pub mod session;
pub mod signaling;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use cipher::{CipherKey, CryptoError};
pub use config::{LinkConfig, SessionOptions};
pub use error::CollabError;
pub use peer::{PeerLink, PeerState};
pub use presence::{Awareness, AwarenessChange, AwarenessEvent, AwarenessOrigin, ClientId};
pub use protocol::{Message, MessageType, ProtocolError, SyncMessage};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{CollabHub, CollabSession, SessionEvent};
pub use signaling::{ConnectionState, Envelope, PeerId, RelayMessage, SignalingLink};
pub use transport::{
    MemoryNetwork, PeerTransport, TcpTransportFactory, TransportError, TransportEvent,
    TransportFactory, TransportSink,
};
