//! Peer discovery over a publish/subscribe relay.

mod link;
pub mod wire;

pub use link::{ConnectionState, SignalingLink};
pub(crate) use link::LinkCommand;
pub use wire::{Envelope, PeerId, RelayMessage};
