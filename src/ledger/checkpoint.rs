//! Checkpoint & Turn Artifacts
//!
//! The two signed artifacts the channel exchanges: snapshots of agreed
//! game state and single-turn inputs. Both are self-describing (they carry
//! their own domain hash) and validated before anything trusts them.

use serde::{Deserialize, Serialize};

use crate::core::felt::FieldElement;
use crate::core::hash::hash_pair;
use crate::core::signature::{AuthenticationError, KeyPair, Signature};
use crate::game::input::{Action, PlayerIndex};
use crate::game::state::GameState;

/// A snapshot of game state the channel can settle on.
///
/// On-chain checkpoints carry no signatures — the chain itself is the
/// authority. Off-chain checkpoints are only trusted once both signature
/// slots verify against the roster keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The snapshotted state.
    pub data: GameState,
    /// Domain hash of `data`.
    pub hash: FieldElement,
    /// Whether this snapshot was read from the chain oracle.
    pub on_chain: bool,
    /// Signature slots, indexed by player number.
    pub signatures: [Option<Signature>; 2],
}

impl Checkpoint {
    /// Wrap an authoritative state fetched from the chain oracle.
    pub fn from_chain(data: GameState) -> Self {
        Self {
            hash: data.hash(),
            data,
            on_chain: true,
            signatures: [None, None],
        }
    }

    /// Build an off-chain checkpoint carrying only the local signature.
    pub fn signed_local(
        data: GameState,
        keypair: &KeyPair,
        player: PlayerIndex,
    ) -> Result<Self, AuthenticationError> {
        let hash = data.hash();
        let signature = keypair.sign(&hash)?;

        let mut signatures = [None, None];
        signatures[player.slot()] = Some(signature);

        Ok(Self {
            data,
            hash,
            on_chain: false,
            signatures,
        })
    }

    /// Turn number this checkpoint snapshots.
    pub fn turn(&self) -> u64 {
        self.data.turn
    }

    /// Does the carried hash match the carried state?
    pub fn verify_hash(&self) -> bool {
        self.hash == self.data.hash()
    }

    /// Verify every present signature against its slot's roster key.
    ///
    /// Returns the slots that carry a valid signature. Any present but
    /// invalid signature fails the whole artifact — a peer sending one is
    /// either buggy or lying, and neither deserves partial credit.
    pub fn valid_signature_slots(
        &self,
        roster_keys: &[FieldElement; 2],
    ) -> Result<Vec<usize>, AuthenticationError> {
        let mut valid = Vec::new();
        for (slot, signature) in self.signatures.iter().enumerate() {
            if let Some(signature) = signature {
                if !signature.verify(&self.hash, &roster_keys[slot]) {
                    return Err(AuthenticationError::InvalidSignature);
                }
                valid.push(slot);
            }
        }
        Ok(valid)
    }

    /// Is this checkpoint signed (validly) by both players?
    pub fn is_fully_signed(&self, roster_keys: &[FieldElement; 2]) -> bool {
        matches!(self.valid_signature_slots(roster_keys), Ok(slots) if slots.len() == 2)
    }

    /// Does a signature occupy the given slot?
    pub fn has_signature(&self, slot: usize) -> bool {
        self.signatures.get(slot).map(Option::is_some).unwrap_or(false)
    }

    /// Add the local player's signature over this checkpoint's hash.
    pub fn co_sign(
        &mut self,
        keypair: &KeyPair,
        player: PlayerIndex,
    ) -> Result<(), AuthenticationError> {
        let signature = keypair.sign(&self.hash)?;
        self.signatures[player.slot()] = Some(signature);
        Ok(())
    }

    /// Copy signatures present in `other` into empty local slots.
    ///
    /// Caller must have validated `other` against the same hash first.
    pub fn merge_signatures(&mut self, other: &Checkpoint) {
        for slot in 0..2 {
            if self.signatures[slot].is_none() {
                self.signatures[slot] = other.signatures[slot];
            }
        }
    }
}

/// One player's signed input at a specific turn number.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SignedTurn {
    /// Sequence number; decides the signer by parity.
    pub turn: u64,
    /// The input itself.
    pub action: Action,
    /// Domain hash of `(turn, action)`.
    pub hash: FieldElement,
    /// The acting player's signature over `hash`.
    pub signature: Signature,
}

impl SignedTurn {
    /// Hash the `(turn, action)` pair.
    pub fn compute_hash(turn: u64, action: Action) -> FieldElement {
        hash_pair(&FieldElement::from(turn), &action.encode())
    }

    /// Create and sign a turn as the local player.
    pub fn create(
        turn: u64,
        action: Action,
        keypair: &KeyPair,
    ) -> Result<Self, AuthenticationError> {
        let hash = Self::compute_hash(turn, action);
        let signature = keypair.sign(&hash)?;
        Ok(Self {
            turn,
            action,
            hash,
            signature,
        })
    }

    /// The player whose parity matches this turn number.
    pub fn signer(&self) -> PlayerIndex {
        PlayerIndex::acting_on(self.turn)
    }

    /// Validate hash integrity and the signature against the signer's
    /// roster key.
    pub fn verify(&self, roster_keys: &[FieldElement; 2]) -> Result<(), AuthenticationError> {
        if self.hash != Self::compute_hash(self.turn, self.action) {
            return Err(AuthenticationError::HashMismatch);
        }
        let key = &roster_keys[self.signer().slot()];
        if !self.signature.verify(&self.hash, key) {
            return Err(AuthenticationError::InvalidSignature);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keypairs() -> (KeyPair, KeyPair) {
        (
            KeyPair::from_private(FieldElement::from(1111u64)),
            KeyPair::from_private(FieldElement::from(2222u64)),
        )
    }

    fn roster(k0: &KeyPair, k1: &KeyPair) -> [FieldElement; 2] {
        [k0.public_key(), k1.public_key()]
    }

    #[test]
    fn test_signed_local_checkpoint() {
        let (k0, k1) = keypairs();
        let keys = roster(&k0, &k1);
        let cp = Checkpoint::signed_local(GameState::initial(), &k0, PlayerIndex::Zero).unwrap();

        assert!(cp.verify_hash());
        assert!(!cp.on_chain);
        assert!(cp.has_signature(0));
        assert!(!cp.has_signature(1));
        assert_eq!(cp.valid_signature_slots(&keys).unwrap(), vec![0]);
        assert!(!cp.is_fully_signed(&keys));
    }

    #[test]
    fn test_co_sign_completes_checkpoint() {
        let (k0, k1) = keypairs();
        let keys = roster(&k0, &k1);

        let mut cp =
            Checkpoint::signed_local(GameState::initial(), &k0, PlayerIndex::Zero).unwrap();
        cp.co_sign(&k1, PlayerIndex::One).unwrap();

        assert!(cp.is_fully_signed(&keys));
    }

    #[test]
    fn test_invalid_present_signature_fails_whole_artifact() {
        let (k0, k1) = keypairs();
        let keys = roster(&k0, &k1);
        let intruder = KeyPair::from_private(FieldElement::from(3333u64));

        let mut cp =
            Checkpoint::signed_local(GameState::initial(), &k0, PlayerIndex::Zero).unwrap();
        // Slot 1 signed by the wrong key: the artifact as a whole fails.
        cp.signatures[1] = Some(intruder.sign(&cp.hash).unwrap());

        assert!(matches!(
            cp.valid_signature_slots(&keys),
            Err(AuthenticationError::InvalidSignature)
        ));
        assert!(!cp.is_fully_signed(&keys));
    }

    #[test]
    fn test_merge_signatures_fills_empty_slots_only() {
        let (k0, k1) = keypairs();
        let state = GameState::initial();

        let mut mine = Checkpoint::signed_local(state, &k0, PlayerIndex::Zero).unwrap();
        let theirs = Checkpoint::signed_local(state, &k1, PlayerIndex::One).unwrap();

        let own = mine.signatures[0];
        mine.merge_signatures(&theirs);

        assert_eq!(mine.signatures[0], own);
        assert_eq!(mine.signatures[1], theirs.signatures[1]);
    }

    #[test]
    fn test_turn_create_and_verify() {
        let (k0, k1) = keypairs();
        let keys = roster(&k0, &k1);

        // Turn 4 has even parity: player 0 signs.
        let turn = SignedTurn::create(4, Action::MoveDown, &k0).unwrap();
        assert_eq!(turn.signer(), PlayerIndex::Zero);
        turn.verify(&keys).unwrap();
    }

    #[test]
    fn test_turn_wrong_parity_signer_rejected() {
        let (k0, k1) = keypairs();
        let keys = roster(&k0, &k1);

        // Player 0 signing an odd turn verifies against player 1's key and
        // must fail.
        let turn = SignedTurn::create(5, Action::MoveUp, &k0).unwrap();
        assert!(matches!(
            turn.verify(&keys),
            Err(AuthenticationError::InvalidSignature)
        ));
    }

    #[test]
    fn test_corrupted_turn_hash_always_rejected() {
        let (k0, k1) = keypairs();
        let keys = roster(&k0, &k1);

        let turn = SignedTurn::create(6, Action::NoMove, &k0).unwrap();

        // Corrupt the carried hash.
        let mut corrupted = turn;
        corrupted.hash = FieldElement::from(999u64);
        assert!(matches!(
            corrupted.verify(&keys),
            Err(AuthenticationError::HashMismatch)
        ));

        // Corrupt the covered fields: the carried hash no longer matches.
        let mut wrong_turn = turn;
        wrong_turn.turn += 2;
        assert!(matches!(
            wrong_turn.verify(&keys),
            Err(AuthenticationError::HashMismatch)
        ));

        let mut wrong_action = turn;
        wrong_action.action = Action::MoveDown;
        assert!(matches!(
            wrong_action.verify(&keys),
            Err(AuthenticationError::HashMismatch)
        ));
    }

    #[test]
    fn test_checkpoint_serde_roundtrip() {
        let (k0, _) = keypairs();
        let cp = Checkpoint::signed_local(GameState::initial(), &k0, PlayerIndex::Zero).unwrap();

        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();

        assert_eq!(back.hash, cp.hash);
        assert_eq!(back.data, cp.data);
        assert_eq!(back.signatures[0], cp.signatures[0]);
    }
}
