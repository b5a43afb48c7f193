//! # Pong Channel
//!
//! Off-chain state channel engine for a two-player on-chain Pong game.
//! Turn-by-turn play happens peer-to-peer; the blockchain contract is
//! consulted only as the authoritative oracle and final arbiter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PONG CHANNEL                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic crypto primitives           │
//! │  ├── felt.rs     - Stark field element wrapper               │
//! │  ├── hash.rs     - Chained Pedersen domain hash              │
//! │  └── signature.rs- Curve signatures + identity proofs        │
//! │                                                              │
//! │  game/           - Game logic (deterministic)                │
//! │  ├── input.rs    - Per-turn actions, acting-player parity    │
//! │  ├── state.rs    - Game state + canonical encoding           │
//! │  └── tick.rs     - Pure turn transition function             │
//! │                                                              │
//! │  ledger/         - Checkpoint + turn storage                 │
//! │  ├── checkpoint.rs - Signed checkpoint/turn artifacts        │
//! │  ├── store.rs    - Durable key→JSON blob collaborator        │
//! │  └── mod.rs      - Replay, pruning, write-ahead append       │
//! │                                                              │
//! │  network/        - Sync protocol (message-driven)            │
//! │  ├── protocol.rs - Versioned typed wire schema               │
//! │  ├── chain.rs    - Chain oracle collaborator seam            │
//! │  ├── transport.rs- Peer transport collaborator seam          │
//! │  └── session.rs  - Session state machine + reconciliation    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules are **100% deterministic**:
//! - Integer-only arithmetic, direction flags instead of signs
//! - Serve "randomization" is a fixed rule keyed on the turn number
//! - No system time dependencies in any hashed or replayed path
//!
//! Given identical checkpoints and turn sequences, both peers and the
//! on-chain contract reproduce **identical states and hashes**.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod ledger;
pub mod network;

// Re-export commonly used types
pub use core::felt::FieldElement;
pub use core::signature::{IdentityProof, KeyPair, Signature};
pub use game::input::{Action, PlayerIndex};
pub use game::state::GameState;
pub use game::tick::transition;
pub use ledger::{Checkpoint, Ledger, SignedTurn};
pub use network::session::{Session, SessionConfig, SessionHandle, SessionStatus};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
