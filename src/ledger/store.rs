//! Durable Local Store
//!
//! The key→JSON blob collaborator the ledger persists into, plus the
//! per-room storage key derivation. The backing medium is external; an
//! in-memory implementation ships for tests and the demo binary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::felt::FieldElement;
use crate::ledger::checkpoint::{Checkpoint, SignedTurn};

/// Storage failures. Treated as retryable by callers, never a panic.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing medium rejected the operation.
    #[error("storage backend: {0}")]
    Backend(String),
    /// A stored blob could not be decoded.
    #[error("corrupt stored blob: {0}")]
    Corrupt(String),
}

/// Durable key→bytes store.
pub trait KvStore: Send {
    /// Read a value, `None` if the key was never written.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Write a value, replacing any previous one.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
}

/// In-memory store; clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self
            .map
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut map = self
            .map
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        map.insert(key.to_string(), value);
        Ok(())
    }
}

/// Derive the storage key for a room: a stable digest of room address and
/// local account address under a crate-specific domain prefix.
pub fn room_storage_key(room_address: &FieldElement, account: &FieldElement) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"pong-channel-room:");
    hasher.update(room_address.to_bytes_be());
    hasher.update(account.to_bytes_be());
    hex::encode(hasher.finalize())
}

/// The persisted per-room blob: the adopted checkpoint and every turn
/// since it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoredGame {
    /// Last adopted checkpoint, if any was persisted.
    pub checkpoint: Option<Checkpoint>,
    /// Turns at or above the checkpoint's turn number.
    #[serde(default)]
    pub turns: Vec<SignedTurn>,
}

impl StoredGame {
    /// Encode as the stored JSON blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Decode a stored JSON blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

// =============================================================================
// TESTS
// =============================================================================
