//! Chain Oracle
//!
//! The blockchain contract consulted as an authoritative read/write
//! oracle. The contract itself is out of scope; this module only defines
//! the collaborator seam and an in-memory implementation for tests and
//! the demo binary.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::felt::FieldElement;
use crate::game::input::PlayerIndex;
use crate::game::state::GameState;
use crate::ledger::checkpoint::Checkpoint;

/// Oracle failures. Always retryable: "state unavailable, try again".
#[derive(Debug, Error)]
pub enum OracleError {
    /// The chain call failed or timed out.
    #[error("chain oracle unavailable: {0}")]
    Unavailable(String),
}

/// One registered room participant.
#[derive(Clone, Debug)]
pub struct RoomPlayer {
    /// Account address on-chain.
    pub address: FieldElement,
    /// Off-chain public key registered for this room.
    pub stark_key: FieldElement,
}

/// The room's two registered participants, indexed by player number.
#[derive(Clone, Debug)]
pub struct RoomRoster {
    /// Participants in slot order.
    pub players: [RoomPlayer; 2],
}

impl RoomRoster {
    /// The participant in the given slot.
    pub fn player(&self, index: PlayerIndex) -> &RoomPlayer {
        &self.players[index.slot()]
    }

    /// Both off-chain public keys, in slot order.
    pub fn keys(&self) -> [FieldElement; 2] {
        [self.players[0].stark_key, self.players[1].stark_key]
    }
}

/// Read/write access to the on-chain room contract.
///
/// Calls are made from the session's event loop; implementations must
/// enforce their own bounded timeouts and report failure as
/// [`OracleError::Unavailable`].
pub trait ChainOracle: Send {
    /// Latest authoritative game state, `None` before the first on-chain
    /// checkpoint.
    fn authoritative_state(&self) -> Result<Option<GameState>, OracleError>;

    /// The room's registered participants.
    fn room_roster(&self) -> Result<RoomRoster, OracleError>;

    /// Submit a dual-signed checkpoint for settlement.
    fn submit_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), OracleError>;

    /// Close the room after settlement.
    fn close_room(&self) -> Result<(), OracleError>;
}

/// In-memory oracle for tests and the demo binary; clones share state.
#[derive(Clone)]
pub struct MockOracle {
    roster: RoomRoster,
    state: Arc<Mutex<Option<GameState>>>,
    submitted: Arc<Mutex<Vec<Checkpoint>>>,
}

impl MockOracle {
    /// Create an oracle for the given roster with no on-chain state yet.
    pub fn new(roster: RoomRoster) -> Self {
        Self {
            roster,
            state: Arc::new(Mutex::new(None)),
            submitted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the authoritative state returned to sessions.
    pub fn set_state(&self, state: Option<GameState>) {
        *self.state.lock().unwrap() = state;
    }

    /// Checkpoints submitted so far.
    pub fn submissions(&self) -> Vec<Checkpoint> {
        self.submitted.lock().unwrap().clone()
    }
}

impl ChainOracle for MockOracle {
    fn authoritative_state(&self) -> Result<Option<GameState>, OracleError> {
        Ok(*self.state.lock().unwrap())
    }

    fn room_roster(&self) -> Result<RoomRoster, OracleError> {
        Ok(self.roster.clone())
    }

    fn submit_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), OracleError> {
        self.submitted.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }

    fn close_room(&self) -> Result<(), OracleError> {
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
