//! Binary Merkle tree over an ordered list of hashes.
//!
//! Blocks commit to their ledger and validator transaction lists through
//! two roots built here. Order matters: the same items in a different order
//! give a different root.
//!
//! Construction rules (identical for building and verifying):
//! - leaves are `H(0x00 || item)`, internal nodes `H(0x01 || left || right)`
//! - a level with an odd node count promotes its last node unchanged
//! - the empty list has the zero hash as root

use crate::crypto::keccak256;
use crate::types::{Hash, ZERO_HASH};

/// Domain separator for leaf nodes (prevents second-preimage attacks).
const LEAF_PREFIX: u8 = 0x00;
/// Domain separator for internal nodes.
const INTERNAL_PREFIX: u8 = 0x01;

/// Merkle tree with every level retained, so proofs are cheap.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` are leaf hashes, the last level holds the root.
    levels: Vec<Vec<Hash>>,
}

/// Inclusion proof for a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Position of the item in the original list.
    pub index: usize,
    /// Sibling hashes along the path from leaf to root.
    pub siblings: Vec<Hash>,
    /// For each sibling: true if our node sits on the left.
    pub path_bits: Vec<bool>,
}

impl MerkleTree {
    /// Build a tree from items in list order.
    pub fn new(items: &[Hash]) -> Self {
        let leaves: Vec<Hash> = items.iter().map(hash_leaf).collect();
        let mut levels = vec![leaves];
        while let Some(top) = levels.last() {
            if top.len() <= 1 {
                break;
            }
            let next = next_level(top);
            levels.push(next);
        }
        Self { levels }
    }

    pub fn root(&self) -> Hash {
        match self.levels.last().and_then(|top| top.first()) {
            Some(root) => *root,
            None => ZERO_HASH,
        }
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Generate an inclusion proof for the item at `index`.
    pub fn prove(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.len() {
            return None;
        }
        let mut siblings = Vec::new();
        let mut path_bits = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            if sibling_idx < level.len() {
                siblings.push(level[sibling_idx]);
                path_bits.push(idx % 2 == 0);
            }
            // else: promoted odd node, no sibling at this level
            idx /= 2;
        }
        Some(MerkleProof {
            index,
            siblings,
            path_bits,
        })
    }

    /// Verify that `item` is committed under `root` by `proof`.
    pub fn verify_proof(root: &Hash, proof: &MerkleProof, item: &Hash) -> bool {
        if proof.siblings.len() != proof.path_bits.len() {
            return false;
        }
        let mut current = hash_leaf(item);
        for (sibling, is_left) in proof.siblings.iter().zip(proof.path_bits.iter()) {
            current = if *is_left {
                hash_internal(&current, sibling)
            } else {
                hash_internal(sibling, &current)
            };
        }
        current == *root
    }
}

/// Merkle root of an ordered list of hashes.
pub fn merkle_root(items: &[Hash]) -> Hash {
    MerkleTree::new(items).root()
}

fn hash_leaf(item: &Hash) -> Hash {
    let mut data = [0u8; 1 + 32];
    data[0] = LEAF_PREFIX;
    data[1..].copy_from_slice(item);
    keccak256(&data)
}

fn hash_internal(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 1 + 32 + 32];
    data[0] = INTERNAL_PREFIX;
    data[1..33].copy_from_slice(left);
    data[33..65].copy_from_slice(right);
    keccak256(&data)
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_internal(left, right),
            [odd] => *odd,
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}
