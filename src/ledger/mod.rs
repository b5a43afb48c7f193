//! Checkpoint + Turn Ledger
//!
//! Owns the adopted checkpoint, the gap-free turn list above it, and the
//! replayed current state. Every accepted artifact is persisted before it
//! touches in-memory state (write-ahead discipline), so a crash never
//! loses an accepted turn.
//!
//! The ledger is mechanical: it checks sequence and reachability, never
//! signatures. Trust decisions (who signed what) belong to the session.

pub mod checkpoint;
pub mod store;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::felt::FieldElement;
use crate::core::signature::KeyPair;
use crate::game::input::PlayerIndex;
use crate::game::state::GameState;
use crate::game::tick::transition;

pub use checkpoint::{Checkpoint, SignedTurn};
pub use store::{room_storage_key, KvStore, MemoryStore, StoreError, StoredGame};

/// Ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A turn arrived beyond the next expected sequence number.
    #[error("non-sequential turn {got}, expected {expected}")]
    NonSequentialTurn {
        /// The offending turn number.
        got: u64,
        /// The next turn the ledger would accept.
        expected: u64,
    },
    /// No turn sequence reaches the requested checkpoint target exactly.
    #[error("no turn sequence reaches turn {0}")]
    UnreachableTarget(u64),
    /// The game is already decided; nothing can advance past it.
    #[error("terminal state cannot advance")]
    TerminalState,
    /// The signing primitive failed while building a checkpoint.
    #[error("checkpoint signing failed")]
    SigningFailed,
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// The channel's single mutable shared structure for a session.
pub struct Ledger {
    checkpoint: Checkpoint,
    turns: Vec<SignedTurn>,
    current_state: GameState,
    store: Box<dyn KvStore>,
    storage_key: String,
}

impl Ledger {
    /// Validate what storage holds for this room.
    ///
    /// An `on_chain` checkpoint found in storage is never trusted — chain
    /// truth must be re-fetched — and an off-chain one must pass hash and
    /// full dual-signature verification or it is discarded. Stored turns
    /// that fail hash or signature checks are dropped individually.
    pub fn recover(
        store: &dyn KvStore,
        storage_key: &str,
        roster_keys: &[FieldElement; 2],
    ) -> Result<(Option<Checkpoint>, Vec<SignedTurn>), LedgerError> {
        let Some(bytes) = store.get(storage_key)? else {
            return Ok((None, Vec::new()));
        };

        let blob = match StoredGame::from_bytes(&bytes) {
            Ok(blob) => blob,
            Err(err) => {
                warn!("discarding unreadable stored game: {err}");
                return Ok((None, Vec::new()));
            }
        };

        let checkpoint = blob.checkpoint.and_then(|cp| {
            if cp.on_chain {
                warn!("discarding stored on-chain checkpoint at turn {}", cp.turn());
                return None;
            }
            if !cp.verify_hash() {
                warn!("discarding stored checkpoint with bad hash");
                return None;
            }
            if !cp.is_fully_signed(roster_keys) {
                warn!(
                    "discarding stored checkpoint at turn {} without dual signatures",
                    cp.turn()
                );
                return None;
            }
            debug!("recovered checkpoint at turn {}", cp.turn());
            Some(cp)
        });

        let mut turns: Vec<SignedTurn> = blob
            .turns
            .into_iter()
            .filter(|turn| match turn.verify(roster_keys) {
                Ok(()) => true,
                Err(err) => {
                    warn!("discarding stored turn {}: {err}", turn.turn);
                    false
                }
            })
            .collect();
        turns.sort_by_key(|t| t.turn);
        turns.dedup_by_key(|t| t.turn);

        Ok((checkpoint, turns))
    }

    /// Open a ledger from a trusted checkpoint and candidate turns.
    ///
    /// Prunes, replays and persists immediately.
    pub fn open(
        checkpoint: Checkpoint,
        turns: Vec<SignedTurn>,
        store: Box<dyn KvStore>,
        storage_key: String,
    ) -> Result<Self, LedgerError> {
        let current_state = checkpoint.data;
        let mut ledger = Self {
            checkpoint,
            turns,
            current_state,
            store,
            storage_key,
        };
        ledger.prune_and_replay();
        ledger.persist()?;
        Ok(ledger)
    }

    /// The replayed head state.
    pub fn current_state(&self) -> &GameState {
        &self.current_state
    }

    /// Turn number of the head state; also the next turn the ledger will
    /// accept.
    pub fn current_turn(&self) -> u64 {
        self.current_state.turn
    }

    /// The adopted checkpoint.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Turns above the checkpoint, ascending and gap-free.
    pub fn turns(&self) -> &[SignedTurn] {
        &self.turns
    }

    /// Drop turns below the checkpoint and refold the transition function
    /// from the checkpoint state. Idempotent: with no new turns, a second
    /// call yields the same state.
    pub fn prune_and_replay(&mut self) {
        let floor = self.checkpoint.turn();
        self.turns.retain(|t| t.turn >= floor);
        self.turns.sort_by_key(|t| t.turn);
        self.turns.dedup_by_key(|t| t.turn);

        let mut state = self.checkpoint.data;
        let mut applied = 0usize;
        for turn in &self.turns {
            if turn.turn != state.turn {
                warn!(
                    "turn gap during replay: have {}, expected {}; dropping tail",
                    turn.turn, state.turn
                );
                break;
            }
            match transition(&state, turn.action) {
                Some(next) => {
                    state = next;
                    applied += 1;
                }
                None => {
                    warn!("turns recorded past terminal state; dropping tail");
                    break;
                }
            }
        }
        self.turns.truncate(applied);
        self.current_state = state;
    }

    /// Append the next turn.
    ///
    /// Accepted only in sequence; a stale duplicate is a silent no-op
    /// (`Ok(false)`), a gap is an error. The turn is persisted before the
    /// in-memory state advances.
    pub fn append_turn(&mut self, turn: SignedTurn) -> Result<bool, LedgerError> {
        let expected = self.current_turn();

        if turn.turn < expected {
            debug!("ignoring duplicate turn {}", turn.turn);
            return Ok(false);
        }
        if turn.turn > expected {
            return Err(LedgerError::NonSequentialTurn {
                got: turn.turn,
                expected,
            });
        }

        let next = transition(&self.current_state, turn.action)
            .ok_or(LedgerError::TerminalState)?;

        self.turns.push(turn);
        if let Err(err) = self.persist() {
            self.turns.pop();
            return Err(err);
        }
        self.current_state = next;
        Ok(true)
    }

    /// Replay up to `target` and return a new off-chain checkpoint signed
    /// by the local player only.
    pub fn build_checkpoint_at(
        &self,
        target: u64,
        keypair: &KeyPair,
        player: PlayerIndex,
    ) -> Result<Checkpoint, LedgerError> {
        if target < self.checkpoint.turn() || target > self.current_turn() {
            return Err(LedgerError::UnreachableTarget(target));
        }

        let mut state = self.checkpoint.data;
        for turn in &self.turns {
            if state.turn == target {
                break;
            }
            state = transition(&state, turn.action).ok_or(LedgerError::TerminalState)?;
        }
        if state.turn != target {
            return Err(LedgerError::UnreachableTarget(target));
        }

        Checkpoint::signed_local(state, keypair, player).map_err(|_| LedgerError::SigningFailed)
    }

    /// Adopt a checkpoint at or above the current one.
    ///
    /// Performs no signature verification — the caller owns the trust
    /// decision. Persists, prunes and replays on acceptance; returns
    /// `Ok(false)` for an older checkpoint.
    pub fn adopt_checkpoint(&mut self, new_checkpoint: Checkpoint) -> Result<bool, LedgerError> {
        if new_checkpoint.turn() < self.checkpoint.turn() {
            debug!(
                "rejecting stale checkpoint at turn {} (have {})",
                new_checkpoint.turn(),
                self.checkpoint.turn()
            );
            return Ok(false);
        }

        self.checkpoint = new_checkpoint;
        self.prune_and_replay();
        self.persist()?;
        debug!("adopted checkpoint at turn {}", self.checkpoint.turn());
        Ok(true)
    }

    fn persist(&self) -> Result<(), LedgerError> {
        let blob = StoredGame {
            checkpoint: Some(self.checkpoint.clone()),
            turns: self.turns.clone(),
        };
        self.store.put(&self.storage_key, blob.to_bytes()?)?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
