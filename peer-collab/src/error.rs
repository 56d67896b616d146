//! Crate-level error type.
//!
//! Each layer keeps its own error enum ([`CryptoError`], [`ProtocolError`],
//! [`TransportError`]); [`CollabError`] wraps them for the public API.

use thiserror::Error;

use crate::cipher::CryptoError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum CollabError {
    /// A second session tried to open a room name that is already open.
    #[error("A document is already connected to room '{0}'")]
    RoomAlreadyOpen(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The replicated document rejected an operation.
    #[error("Document error: {0}")]
    Document(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(String),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::Protocol(ProtocolError::from(e))
    }
}
