//! Stark Curve Signatures & Identity Proofs
//!
//! Sign/verify over the platform curve, plus construction and verification
//! of the peer identity proof exchanged during the session handshake.

use serde::{Deserialize, Serialize};
use starknet_crypto::{get_public_key, rfc6979_generate_k, sign, verify};
use thiserror::Error;

use super::felt::FieldElement;
use super::hash::chain_hash;

/// How far an identity-proof timestamp may drift from local time (ms).
pub const IDENTITY_FRESHNESS_MS: u64 = 10_000;

/// Authentication errors.
///
/// All of these are non-fatal at the session layer: the offending message
/// is logged and dropped.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// Signature did not verify against the expected public key.
    #[error("invalid signature")]
    InvalidSignature,
    /// The signing primitive rejected the inputs.
    #[error("signing failed")]
    SigningFailed,
    /// Identity proof timestamp outside the freshness window.
    #[error("stale identity proof ({age_ms} ms old)")]
    StaleTimestamp {
        /// Absolute drift between proof timestamp and local clock.
        age_ms: u64,
    },
    /// Identity proof names a different address or key than the roster.
    #[error("identity proof does not match expected opponent")]
    UnexpectedPeer,
    /// Claimed stark key does not match the provided public key bytes.
    #[error("stark key does not match public key")]
    KeyMismatch,
    /// An artifact's hash field does not match its contents.
    #[error("hash does not match artifact contents")]
    HashMismatch,
}

/// An ECDSA signature over the Stark curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// First signature component.
    pub r: FieldElement,
    /// Second signature component.
    pub s: FieldElement,
}

impl Signature {
    /// Verify this signature over `hash` against `public_key`.
    pub fn verify(&self, hash: &FieldElement, public_key: &FieldElement) -> bool {
        verify(public_key.inner(), hash.inner(), self.r.inner(), self.s.inner())
            .unwrap_or(false)
    }
}

/// A local signing key pair.
///
/// The public half is the x-only stark key, which is also what the room
/// roster registers on-chain as the player's off-chain public key.
#[derive(Clone, Debug)]
pub struct KeyPair {
    private: FieldElement,
    public: FieldElement,
}

impl KeyPair {
    /// Derive the key pair from a private key scalar.
    pub fn from_private(private: FieldElement) -> Self {
        let public = FieldElement::from_inner(get_public_key(private.inner()));
        Self { private, public }
    }

    /// The verifying (stark) key.
    pub fn public_key(&self) -> FieldElement {
        self.public
    }

    /// Sign a message hash with a deterministic nonce.
    pub fn sign(&self, hash: &FieldElement) -> Result<Signature, AuthenticationError> {
        let k = rfc6979_generate_k(hash.inner(), self.private.inner(), None);
        let signature = sign(self.private.inner(), hash.inner(), &k)
            .map_err(|_| AuthenticationError::SigningFailed)?;
        Ok(Signature {
            r: FieldElement::from_inner(signature.r),
            s: FieldElement::from_inner(signature.s),
        })
    }
}

/// Peer identity proof exchanged in the `ID` handshake message.
///
/// The proof hash covers `(address, timestamp, stark_key, limb0..limb2)`
/// where the limbs split the public key into hash-width pieces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityProof {
    /// The peer's account address on-chain.
    pub address: FieldElement,
    /// Proof creation time, Unix milliseconds.
    pub timestamp: u64,
    /// The off-chain stark key registered in the room roster.
    pub stark_key: FieldElement,
    /// The verifying key as raw field bytes, limb-split for hashing.
    pub public_key: FieldElement,
    /// Signature over the proof hash.
    pub signature: Signature,
}

impl IdentityProof {
    /// Build a fresh proof for the local player.
    pub fn build(
        address: FieldElement,
        timestamp: u64,
        keypair: &KeyPair,
    ) -> Result<Self, AuthenticationError> {
        let stark_key = keypair.public_key();
        let public_key = keypair.public_key();
        let hash = Self::proof_hash(&address, timestamp, &stark_key, &public_key);
        let signature = keypair.sign(&hash)?;

        Ok(Self {
            address,
            timestamp,
            stark_key,
            public_key,
            signature,
        })
    }

    /// Verify the proof against the expected opponent from the room roster.
    ///
    /// Checks, in order: timestamp freshness, address/key match against the
    /// roster, stark key re-derivation from the public key bytes, and the
    /// signature itself. Freshness is checked first so no curve work is
    /// spent on replayed proofs.
    pub fn verify(
        &self,
        expected_address: &FieldElement,
        expected_stark_key: &FieldElement,
        now_ms: u64,
    ) -> Result<(), AuthenticationError> {
        let age_ms = now_ms.abs_diff(self.timestamp);
        if age_ms >= IDENTITY_FRESHNESS_MS {
            return Err(AuthenticationError::StaleTimestamp { age_ms });
        }

        if self.address != *expected_address || self.stark_key != *expected_stark_key {
            return Err(AuthenticationError::UnexpectedPeer);
        }

        // Re-derive the stark key from the public key bytes independently of
        // the claimed field, so a spoofed stark_key cannot ride on an
        // otherwise valid signature.
        let rederived = FieldElement::from_bytes_be(&self.public_key.to_bytes_be());
        if rederived != self.stark_key {
            return Err(AuthenticationError::KeyMismatch);
        }

        let hash =
            Self::proof_hash(&self.address, self.timestamp, &self.stark_key, &self.public_key);
        if !self.signature.verify(&hash, &self.public_key) {
            return Err(AuthenticationError::InvalidSignature);
        }

        Ok(())
    }

    fn proof_hash(
        address: &FieldElement,
        timestamp: u64,
        stark_key: &FieldElement,
        public_key: &FieldElement,
    ) -> FieldElement {
        let limbs = public_key.split_limbs();
        chain_hash(&[
            *address,
            FieldElement::from(timestamp),
            *stark_key,
            limbs[0],
            limbs[1],
            limbs[2],
        ])
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> KeyPair {
        KeyPair::from_private(FieldElement::from(123_456_789u64))
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = test_keypair();
        let hash = chain_hash(&[FieldElement::from(1u64), FieldElement::from(2u64)]);

        let signature = keypair.sign(&hash).unwrap();
        assert!(signature.verify(&hash, &keypair.public_key()));
    }

    #[test]
    fn test_sign_verify_random_keys() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        for _ in 0..8 {
            let keypair = KeyPair::from_private(FieldElement::from(rng.gen::<u64>() | 1));
            let hash = chain_hash(&[FieldElement::from(rng.gen::<u64>())]);

            let signature = keypair.sign(&hash).unwrap();
            assert!(signature.verify(&hash, &keypair.public_key()));
        }
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let keypair = test_keypair();
        let other = KeyPair::from_private(FieldElement::from(987_654_321u64));
        let hash = chain_hash(&[FieldElement::from(7u64), FieldElement::from(8u64)]);

        let signature = keypair.sign(&hash).unwrap();
        assert!(!signature.verify(&hash, &other.public_key()));
    }

    #[test]
    fn test_wrong_hash_fails_verification() {
        let keypair = test_keypair();
        let hash = chain_hash(&[FieldElement::from(1u64), FieldElement::from(2u64)]);
        let other_hash = chain_hash(&[FieldElement::from(2u64), FieldElement::from(1u64)]);

        let signature = keypair.sign(&hash).unwrap();
        assert!(!signature.verify(&other_hash, &keypair.public_key()));
    }

    #[test]
    fn test_identity_proof_roundtrip() {
        let keypair = test_keypair();
        let address = FieldElement::from_hex("0xabc123").unwrap();
        let now = 1_700_000_000_000u64;

        let proof = IdentityProof::build(address, now, &keypair).unwrap();
        proof
            .verify(&address, &keypair.public_key(), now + 2_000)
            .unwrap();
    }

    #[test]
    fn test_identity_proof_stale_timestamp() {
        let keypair = test_keypair();
        let address = FieldElement::from_hex("0xabc123").unwrap();
        let now = 1_700_000_000_000u64;

        let proof = IdentityProof::build(address, now, &keypair).unwrap();

        // 15 seconds old: rejected before any signature work.
        let result = proof.verify(&address, &keypair.public_key(), now + 15_000);
        assert!(matches!(
            result,
            Err(AuthenticationError::StaleTimestamp { age_ms: 15_000 })
        ));
    }

    #[test]
    fn test_identity_proof_wrong_address() {
        let keypair = test_keypair();
        let address = FieldElement::from_hex("0xabc123").unwrap();
        let other_address = FieldElement::from_hex("0xdef456").unwrap();
        let now = 1_700_000_000_000u64;

        let proof = IdentityProof::build(address, now, &keypair).unwrap();
        let result = proof.verify(&other_address, &keypair.public_key(), now);
        assert!(matches!(result, Err(AuthenticationError::UnexpectedPeer)));
    }

    #[test]
    fn test_identity_proof_spoofed_stark_key() {
        let keypair = test_keypair();
        let victim = KeyPair::from_private(FieldElement::from(55_555u64));
        let address = FieldElement::from_hex("0xabc123").unwrap();
        let now = 1_700_000_000_000u64;

        // Attacker signs with their own key but claims the victim's stark
        // key. The roster expects the victim's key, so the re-derivation
        // check must catch the mismatch.
        let mut proof = IdentityProof::build(address, now, &keypair).unwrap();
        proof.stark_key = victim.public_key();

        let result = proof.verify(&address, &victim.public_key(), now);
        assert!(matches!(result, Err(AuthenticationError::KeyMismatch)));
    }

    #[test]
    fn test_identity_proof_corrupted_signature() {
        let keypair = test_keypair();
        let address = FieldElement::from_hex("0xabc123").unwrap();
        let now = 1_700_000_000_000u64;

        let mut proof = IdentityProof::build(address, now, &keypair).unwrap();
        proof.signature.r = FieldElement::from(1u64);

        let result = proof.verify(&address, &keypair.public_key(), now);
        assert!(matches!(result, Err(AuthenticationError::InvalidSignature)));
    }
}
