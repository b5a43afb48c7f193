//! Domain Hash
//!
//! Canonical digest of encoded states and turns: a chained pairwise
//! Pedersen hash over a field-element sequence. The same construction is
//! evaluated by the on-chain contract, so the fold order is a contract
//! and must not change.

use starknet_crypto::pedersen_hash;

use super::felt::FieldElement;

/// Hash a pair of elements.
///
/// This is the primitive `H` of the chained hash, used directly for turn
/// digests (`H(turn, action)`).
pub fn hash_pair(a: &FieldElement, b: &FieldElement) -> FieldElement {
    FieldElement::from_inner(pedersen_hash(a.inner(), b.inner()))
}

/// Chained pairwise hash over an encoded sequence:
/// `h0 = H(e0, e1); hi = H(h(i-1), ei)`.
///
/// Empty input hashes to zero; a single element hashes as `H(e0, 0)`.
pub fn chain_hash(elements: &[FieldElement]) -> FieldElement {
    match elements {
        [] => FieldElement::ZERO,
        [single] => hash_pair(single, &FieldElement::ZERO),
        [first, second, rest @ ..] => {
            let mut acc = hash_pair(first, second);
            for element in rest {
                acc = hash_pair(&acc, element);
            }
            acc
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
