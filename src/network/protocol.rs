//! Protocol Messages
//!
//! Typed, versioned wire schema for the peer channel. All payloads are
//! tagged serde enums serialized as JSON; malformed or wrong-version
//! envelopes are dropped by the session with a log line, never a crash.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::signature::IdentityProof;
use crate::ledger::checkpoint::{Checkpoint, SignedTurn};

/// Wire schema version carried by every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope carried an unsupported version.
    #[error("unsupported protocol version {0}")]
    Version(u32),
    /// Payload did not parse as a known message.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Checkpoint plus the turns above it — the full shareable channel state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncPayload {
    /// The sender's checkpoint (adopted or pending).
    pub checkpoint: Checkpoint,
    /// Turns at or above the checkpoint's turn number.
    #[serde(default)]
    pub turns: Vec<SignedTurn>,
}

/// Messages exchanged between the two peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetMessage {
    /// Identity proof, sent on peer join.
    Id(IdentityProof),
    /// Checkpoint (+ turns) for reconciliation.
    Sync(SyncPayload),
    /// A single signed turn.
    Turn(SignedTurn),
    /// Request the peer's full state.
    SyncRequest,
    /// Sync completion handshake carrying the sender's current turn.
    SyncOk {
        /// The sender's replayed head turn number.
        turn: u64,
    },
}

/// Versioned envelope around every message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version, [`PROTOCOL_VERSION`].
    pub v: u32,
    /// The payload.
    #[serde(flatten)]
    pub message: NetMessage,
}

impl Envelope {
    /// Wrap a message in a current-version envelope.
    pub fn new(message: NetMessage) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            message,
        }
    }

    /// Serialize to wire bytes (JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse wire bytes, rejecting unknown versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<NetMessage, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if envelope.v != PROTOCOL_VERSION {
            return Err(ProtocolError::Version(envelope.v));
        }
        Ok(envelope.message)
    }
}

// =============================================================================
// TESTS
// =============================================================================
