//! Block and block-level helpers.

use crate::crypto::address::Address;
use crate::transaction::Transaction;
use crate::Hash;

/// A proposed or finalized block.
///
/// `validator_sigs` is positionally indexed by validator-set order; an empty
/// entry means that validator's signature is missing. A block is immutable
/// once the quorum certificate that certifies it is persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub height: u64,
    pub prev_hash: Hash,
    pub state_root: Hash,
    pub timestamp: i64,
    pub proposer: Address,
    pub transactions: Vec<Transaction>,
    pub validator_sigs: Vec<Vec<u8>>,
}

impl Block {
    /// Canonical block hash (SHA-256 over the canonical encoding).
    pub fn hash(&self) -> Hash {
        crate::codec::hash_block(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tracks_contents() {
        let a = Block::default();
        let mut b = Block::default();
        assert_eq!(a.hash(), b.hash());
        b.height = 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn validator_sigs_affect_hash() {
        // Finalized blocks embed quorum signatures, so the finalized hash
        // differs from the proposal-time hash.
        let a = Block::default();
        let mut b = Block::default();
        b.validator_sigs = vec![vec![], vec![]];
        assert_ne!(a.hash(), b.hash());
    }
}
