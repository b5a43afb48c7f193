//! Field Element Wrapper
//!
//! Bounded-width integer type shared by the hash/signature primitives and
//! the on-chain representation. Wraps the Stark prime field element so the
//! rest of the crate never touches the chain SDK's types directly.

use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use starknet_crypto::Felt;
use thiserror::Error;

/// Bit width of a single hash-primitive input limb.
///
/// The on-chain hash only accepts bounded-width inputs, so values wider
/// than this (e.g. public keys) are split into limbs before hashing.
pub const LIMB_BITS: u32 = 250;

/// Errors produced while parsing or converting field values.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Input was not a valid hex-encoded field element.
    #[error("malformed field element: {0}")]
    MalformedHex(String),
    /// Input bytes do not fit the field.
    #[error("value out of field range")]
    OutOfRange,
}

/// A Stark prime field element.
///
/// Canonical wire and storage representation is a `0x`-prefixed hex string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldElement(Felt);

impl Default for FieldElement {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FieldElement {
    /// The additive identity.
    pub const ZERO: FieldElement = FieldElement(Felt::ZERO);

    /// The multiplicative identity.
    pub const ONE: FieldElement = FieldElement(Felt::ONE);

    /// Parse from a `0x`-prefixed (or bare) hex string.
    pub fn from_hex(s: &str) -> Result<Self, EncodingError> {
        Felt::from_hex(s)
            .map(Self)
            .map_err(|_| EncodingError::MalformedHex(s.to_string()))
    }

    /// Construct from big-endian bytes, reducing modulo the field prime.
    pub fn from_bytes_be(bytes: &[u8; 32]) -> Self {
        Self(Felt::from_bytes_be(bytes))
    }

    /// Big-endian byte representation (32 bytes).
    pub fn to_bytes_be(&self) -> [u8; 32] {
        self.0.to_bytes_be()
    }

    /// Hex string with `0x` prefix.
    pub fn to_hex(&self) -> String {
        self.0.to_hex_string()
    }

    /// Access the underlying chain SDK element.
    ///
    /// Only `core/` should need this; everything above works on
    /// `FieldElement`.
    pub(crate) fn inner(&self) -> &Felt {
        &self.0
    }

    /// Wrap a chain SDK element.
    pub(crate) fn from_inner(felt: Felt) -> Self {
        Self(felt)
    }

    /// Split into three limbs of at most [`LIMB_BITS`] bits each,
    /// little-endian limb order (limb 0 holds the lowest bits).
    pub fn split_limbs(&self) -> [FieldElement; 3] {
        let value = self.0.to_biguint();
        let mask = (BigUint::from(1u8) << LIMB_BITS) - BigUint::from(1u8);

        let limb0 = &value & &mask;
        let rem = &value >> LIMB_BITS;
        let limb1 = &rem & &mask;
        let limb2 = &rem >> LIMB_BITS;

        [
            Self::from_biguint(&limb0),
            Self::from_biguint(&limb1),
            Self::from_biguint(&limb2),
        ]
    }

    fn from_biguint(value: &BigUint) -> Self {
        Self(Felt::from_bytes_be_slice(&value.to_bytes_be()))
    }
}

impl From<u64> for FieldElement {
    fn from(value: u64) -> Self {
        Self(Felt::from(value))
    }
}

impl From<bool> for FieldElement {
    fn from(value: bool) -> Self {
        if value {
            Self::ONE
        } else {
            Self::ZERO
        }
    }
}

impl fmt::Display for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex_string())
    }
}

impl Serialize for FieldElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FieldElement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FieldElement::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// TESTS
// =============================================================================
