//! Game State Definitions
//!
//! The channel's shared game state and its canonical field-element
//! encoding. All numeric fields are non-negative fixed-precision integers;
//! direction is carried by boolean flags, never by sign, so both peers and
//! the on-chain contract reproduce identical arithmetic.

use serde::{Deserialize, Serialize};

use crate::core::felt::FieldElement;
use crate::core::hash::chain_hash;
use crate::game::input::PlayerIndex;

// =============================================================================
// CONTRACT PARAMETERS
// =============================================================================

/// Playing field X extent (fixed-precision units).
pub const FIELD_WIDTH: u64 = 8000;

/// Playing field Y extent.
pub const FIELD_HEIGHT: u64 = 6000;

/// Paddle vertical extent.
pub const PADDLE_SIZE: u64 = 1200;

/// Paddle displacement per turn.
pub const PADDLE_SPEED: u64 = 300;

/// Ball diameter.
pub const BALL_SIZE: u64 = 200;

/// Fixed horizontal serve speed.
pub const SERVE_SPEED_X: u64 = 250;

/// Cap for vertical ball speed after a paddle bounce.
pub const MAX_BALL_SPEED_Y: u64 = 250;

/// Floor for vertical ball speed on serve and bounce.
///
/// Keeps a live ball's speed components nonzero, so "a speed component is
/// zero" unambiguously means "fresh serve pending".
pub const MIN_BALL_SPEED_Y: u64 = 50;

/// Terminal score threshold.
pub const WINNING_SCORE: u64 = 3;

/// Turns between checkpoint triggers.
pub const CHECKPOINT_DISTANCE: u64 = 60;

/// Offset so checkpoint triggers land past round turn numbers.
pub const CHECKPOINT_OVERSHOOT: u64 = 2;

// =============================================================================
// STATE TYPES
// =============================================================================

/// One player's paddle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paddle {
    /// Vertical center position.
    pub y: u64,
    /// Vertical extent.
    pub size: u64,
    /// Displacement per turn.
    pub speed: u64,
    /// Direction of the last commanded movement.
    pub moving_up: bool,
}

impl Paddle {
    /// A paddle centered on the field.
    pub fn centered() -> Self {
        Self {
            y: FIELD_HEIGHT / 2,
            size: PADDLE_SIZE,
            speed: PADDLE_SPEED,
            moving_up: false,
        }
    }

    /// Lowest legal center position.
    pub fn min_y(&self) -> u64 {
        self.size / 2
    }

    /// Highest legal center position.
    pub fn max_y(&self) -> u64 {
        FIELD_HEIGHT - self.size / 2
    }
}

/// The ball.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ball {
    /// Horizontal center position.
    pub x: u64,
    /// Vertical center position.
    pub y: u64,
    /// Diameter.
    pub size: u64,
    /// Horizontal speed magnitude.
    pub speed_x: u64,
    /// Vertical speed magnitude.
    pub speed_y: u64,
    /// Moving towards the top of the field.
    pub moving_up: bool,
    /// Moving towards player 0's side.
    pub moving_left: bool,
}

impl Ball {
    /// A motionless ball at field center; the next transition serves it.
    pub fn centered() -> Self {
        Self {
            x: FIELD_WIDTH / 2,
            y: FIELD_HEIGHT / 2,
            size: BALL_SIZE,
            speed_x: 0,
            speed_y: 0,
            moving_up: false,
            moving_left: false,
        }
    }

    /// A zero speed component marks a serve that has not happened yet.
    pub fn awaiting_serve(&self) -> bool {
        self.speed_x == 0 || self.speed_y == 0
    }
}

/// Full shared game state at a single turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// Turn counter; the protocol's sole clock.
    pub turn: u64,
    /// Player 0's score.
    pub score_0: u64,
    /// Player 1's score.
    pub score_1: u64,
    /// Player 0's paddle (left side).
    pub paddle_0: Paddle,
    /// Player 1's paddle (right side).
    pub paddle_1: Paddle,
    /// The ball.
    pub ball: Ball,
}

impl GameState {
    /// Number of elements in the canonical encoding.
    pub const ENCODED_LEN: usize = 19;

    /// The opening state at turn 0.
    pub fn initial() -> Self {
        Self {
            turn: 0,
            score_0: 0,
            score_1: 0,
            paddle_0: Paddle::centered(),
            paddle_1: Paddle::centered(),
            ball: Ball::centered(),
        }
    }

    /// Canonical field-element encoding.
    ///
    /// The field order below is a wire/on-chain contract and must not
    /// change: turn, scores, paddle 0, paddle 1, ball; booleans as 0/1.
    pub fn encode(&self) -> Vec<FieldElement> {
        let mut elements = Vec::with_capacity(Self::ENCODED_LEN);

        elements.push(FieldElement::from(self.turn));
        elements.push(FieldElement::from(self.score_0));
        elements.push(FieldElement::from(self.score_1));

        for paddle in [&self.paddle_0, &self.paddle_1] {
            elements.push(FieldElement::from(paddle.y));
            elements.push(FieldElement::from(paddle.size));
            elements.push(FieldElement::from(paddle.speed));
            elements.push(FieldElement::from(paddle.moving_up));
        }

        elements.push(FieldElement::from(self.ball.x));
        elements.push(FieldElement::from(self.ball.y));
        elements.push(FieldElement::from(self.ball.size));
        elements.push(FieldElement::from(self.ball.speed_x));
        elements.push(FieldElement::from(self.ball.speed_y));
        elements.push(FieldElement::from(self.ball.moving_up));
        elements.push(FieldElement::from(self.ball.moving_left));

        elements
    }

    /// Domain hash of the canonical encoding.
    pub fn hash(&self) -> FieldElement {
        chain_hash(&self.encode())
    }

    /// The winner, if either score reached the terminal threshold.
    pub fn winner(&self) -> Option<PlayerIndex> {
        if self.score_0 >= WINNING_SCORE {
            Some(PlayerIndex::Zero)
        } else if self.score_1 >= WINNING_SCORE {
            Some(PlayerIndex::One)
        } else {
            None
        }
    }

    /// Which player acts on the current turn.
    pub fn acting_player(&self) -> PlayerIndex {
        PlayerIndex::acting_on(self.turn)
    }
}

/// Checkpoint-trigger policy: the player responsible for building the
/// checkpoint at `turn`, alternating every cycle so the cost is shared.
///
/// Returns `None` when `turn` is not a trigger point.
pub fn checkpoint_builder(turn: u64) -> Option<PlayerIndex> {
    if turn < CHECKPOINT_OVERSHOOT {
        return None;
    }
    let offset = turn - CHECKPOINT_OVERSHOOT;
    if offset % CHECKPOINT_DISTANCE != 0 {
        return None;
    }
    if (offset / CHECKPOINT_DISTANCE) % 2 == 0 {
        Some(PlayerIndex::Zero)
    } else {
        Some(PlayerIndex::One)
    }
}

// =============================================================================
// TESTS
// =============================================================================
