//! Game Logic Module
//!
//! The deterministic simulation both peers and the contract replay.
//!
//! ## Module Structure
//!
//! - `input`: per-turn actions and the acting-player parity rule
//! - `state`: shared game state and its canonical encoding
//! - `tick`: the pure turn transition function

pub mod input;
pub mod state;
pub mod tick;

// Re-export key types
pub use input::{Action, PlayerIndex};
pub use state::{Ball, GameState, Paddle};
pub use tick::{replay, transition};
