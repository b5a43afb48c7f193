//! Core deterministic crypto primitives.
//!
//! Field elements, the chained domain hash, and curve signatures. All
//! contract-compatible: the on-chain verifier evaluates the same
//! constructions over the same field.

pub mod felt;
pub mod hash;
pub mod signature;

// Re-export core types
pub use felt::{EncodingError, FieldElement};
pub use hash::{chain_hash, hash_pair};
pub use signature::{AuthenticationError, IdentityProof, KeyPair, Signature};
