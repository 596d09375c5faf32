//! State root: a binary SHA-256 Merkle tree over account entries.
//!
//! Leaves are `SHA-256(0x00 ‖ key ‖ account_bytes)` in ascending key order;
//! inner nodes are `SHA-256(0x01 ‖ left ‖ right)`; odd levels duplicate the
//! last node. The empty state has an all-zero root. The root is a pure
//! function of the set of (key, value) pairs.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::Hash;

const LEAF_DOMAIN: u8 = 0x00;
const INNER_DOMAIN: u8 = 0x01;

/// Compute the state root over key-sorted account pairs.
pub fn compute_state_root(pairs: &BTreeMap<Vec<u8>, Vec<u8>>) -> Hash {
    if pairs.is_empty() {
        return Hash::default();
    }
    let leaves: Vec<Hash> = pairs
        .iter()
        .map(|(key, value)| {
            let mut h = Sha256::new();
            h.update([LEAF_DOMAIN]);
            h.update(key);
            h.update(value);
            h.finalize().into()
        })
        .collect();
    merkle_root(leaves)
}

fn merkle_root(mut nodes: Vec<Hash>) -> Hash {
    while nodes.len() > 1 {
        let mut next = Vec::with_capacity(nodes.len().div_ceil(2));
        for pair in nodes.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let mut h = Sha256::new();
            h.update([INNER_DOMAIN]);
            h.update(left);
            h.update(right);
            next.push(h.finalize().into());
        }
        nodes = next;
    }
    nodes[0]
}
