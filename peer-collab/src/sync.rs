//! Document sync handler over a `yrs` document.
//!
//! Two-message handshake:
//! ```text
//! A ── step-1 (state vector A) ──► B
//! A ◄── step-2 (updates A lacks) ── B
//! ```
//! Both sides send step-1 when a link connects, so each ends up with the
//! other's missing updates. After the handshake, local edits travel as
//! plain updates. Applies are idempotent and commutative, so duplicate or
//! reordered deliveries converge.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::error::CollabError;
use crate::protocol::SyncMessage;

/// Which kind of sync message was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Step1,
    Step2,
    Update,
}

/// Result of handling one inbound sync message.
#[derive(Debug)]
pub struct SyncOutcome {
    pub kind: SyncKind,
    /// Reply owed to the sender (always present for step-1).
    pub reply: Option<SyncMessage>,
}

/// Build the step-1 message describing the local document state.
pub fn step1(doc: &Doc) -> SyncMessage {
    let sv = doc.transact().state_vector().encode_v1();
    SyncMessage::SyncStep1(sv)
}

/// Build the step-2 reply for a remote state vector.
pub fn step2(doc: &Doc, remote_sv: &[u8]) -> Result<SyncMessage, CollabError> {
    let sv = StateVector::decode_v1(remote_sv)?;
    let diff = doc.transact().encode_state_as_update_v1(&sv);
    Ok(SyncMessage::SyncStep2(diff))
}

/// Apply a remote update, tagging the transaction with `origin` so the
/// session's own update observer can skip it.
pub fn apply_update(doc: &Doc, update: &[u8], origin: &Origin) -> Result<(), CollabError> {
    let update = Update::decode_v1(update)?;
    let mut txn = doc.transact_mut_with(origin.clone());
    txn.apply_update(update)
        .map_err(|e| CollabError::Document(e.to_string()))?;
    Ok(())
}

/// Process one sync message from a peer.
pub fn handle_sync_message(
    doc: &Doc,
    msg: SyncMessage,
    origin: &Origin,
) -> Result<SyncOutcome, CollabError> {
    match msg {
        SyncMessage::SyncStep1(sv) => Ok(SyncOutcome {
            kind: SyncKind::Step1,
            reply: Some(step2(doc, &sv)?),
        }),
        SyncMessage::SyncStep2(update) => {
            apply_update(doc, &update, origin)?;
            Ok(SyncOutcome {
                kind: SyncKind::Step2,
                reply: None,
            })
        }
        SyncMessage::Update(update) => {
            apply_update(doc, &update, origin)?;
            Ok(SyncOutcome {
                kind: SyncKind::Update,
                reply: None,
            })
        }
    }
}
