//! Player Input
//!
//! The single per-turn input primitive and the parity rule deciding which
//! player acts on a given turn number.

use serde::{Deserialize, Serialize};

use crate::core::felt::FieldElement;

/// One player's input for a single turn.
///
/// The felt encoding (0/1/2) is part of the turn-hash wire contract and
/// must not change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Move the paddle towards the top of the field.
    MoveUp,
    /// Leave the paddle where it is.
    #[default]
    NoMove,
    /// Move the paddle towards the bottom of the field.
    MoveDown,
}

impl Action {
    /// Canonical field-element encoding.
    pub fn encode(&self) -> FieldElement {
        FieldElement::from(match self {
            Action::MoveUp => 0u64,
            Action::NoMove => 1u64,
            Action::MoveDown => 2u64,
        })
    }
}

/// One of the two channel participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerIndex {
    /// The player registered in roster slot 0 (left paddle).
    Zero,
    /// The player registered in roster slot 1 (right paddle).
    One,
}

impl PlayerIndex {
    /// Which player acts on the given turn number (`turn mod 2`).
    pub fn acting_on(turn: u64) -> Self {
        if turn % 2 == 0 {
            PlayerIndex::Zero
        } else {
            PlayerIndex::One
        }
    }

    /// Signature/roster slot index.
    pub fn slot(&self) -> usize {
        match self {
            PlayerIndex::Zero => 0,
            PlayerIndex::One => 1,
        }
    }

    /// The other participant.
    pub fn opponent(&self) -> Self {
        match self {
            PlayerIndex::Zero => PlayerIndex::One,
            PlayerIndex::One => PlayerIndex::Zero,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
