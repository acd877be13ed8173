// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! Binary merkle tree with sorted-pair hashing, laid out the way the L1 contract's proof
//! verifier expects.
//!
//! Leaves are sorted by hash and stored in a complete binary tree packed into one array:
//! `tree[0]` is the root, the children of node `i` are `2i + 1` and `2i + 2`, and the leaves
//! fill the tail of the array in reverse sorted order. Internal nodes hash
//! `min(a, b) || max(a, b)`, so a proof is just the list of sibling hashes with no left/right
//! flags. The root commits to the set of leaves, not to their order.

use crate::error::RollupError;
use ethers::{types::H256, utils::keccak256};

#[derive(Clone, Debug)]
pub struct MerkleTree {
    tree: Vec<H256>,
    /// `positions[i]` is the slot in `tree` of the `i`-th leaf as it was passed to `build`.
    positions: Vec<usize>,
}

pub fn hash_pair(a: &H256, b: &H256) -> H256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_bytes());
    buf[32..].copy_from_slice(hi.as_bytes());
    H256(keccak256(buf))
}

impl MerkleTree {
    pub fn build(leaves: Vec<H256>) -> Result<Self, RollupError> {
        if leaves.is_empty() {
            return Err(RollupError::EmptyTree);
        }
        let mut order: Vec<usize> = (0..leaves.len()).collect();
        order.sort_by_key(|&i| leaves[i]);

        let size = 2 * leaves.len() - 1;
        let mut tree = vec![H256::zero(); size];
        let mut positions = vec![0; leaves.len()];
        for (rank, &input) in order.iter().enumerate() {
            let slot = size - 1 - rank;
            tree[slot] = leaves[input];
            positions[input] = slot;
        }
        for i in (0..size - leaves.len()).rev() {
            tree[i] = hash_pair(&tree[2 * i + 1], &tree[2 * i + 2]);
        }
        Ok(Self { tree, positions })
    }

    pub fn root(&self) -> H256 {
        self.tree[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.positions.len()
    }

    /// Sibling hashes from the leaf at input position `index` up to (excluding) the root.
    pub fn proof(&self, index: usize) -> Result<Vec<H256>, RollupError> {
        let Some(&slot) = self.positions.get(index) else {
            return Err(RollupError::LeafOutOfRange {
                index,
                len: self.leaf_count(),
            });
        };
        let mut proof = vec![];
        let mut node = slot;
        while node > 0 {
            let sibling = if node % 2 == 1 { node + 1 } else { node - 1 };
            proof.push(self.tree[sibling]);
            node = (node - 1) / 2;
        }
        Ok(proof)
    }

    pub fn verify(root: &H256, leaf: &H256, proof: &[H256]) -> bool {
        let computed = proof
            .iter()
            .fold(*leaf, |node, sibling| hash_pair(&node, sibling));
        computed == *root
    }
}

/// Root over `leaves`, failing on an empty list.
pub fn root(leaves: Vec<H256>) -> Result<H256, RollupError> {
    Ok(MerkleTree::build(leaves)?.root())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u64) -> Vec<H256> {
        (0..n)
            .map(|i| H256(keccak256(i.to_be_bytes())))
            .collect()
    }

    #[test]
    fn test_empty_tree_is_rejected() {
        assert!(matches!(
            MerkleTree::build(vec![]),
            Err(RollupError::EmptyTree)
        ));
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let leaf = leaves(1)[0];
        let tree = MerkleTree::build(vec![leaf]).unwrap();
        assert_eq!(tree.root(), leaf);
        assert!(tree.proof(0).unwrap().is_empty());
        assert!(MerkleTree::verify(&tree.root(), &leaf, &[]));
    }

    #[test]
    fn test_every_proof_verifies() {
        for n in 1..=17 {
            let leaves = leaves(n);
            let tree = MerkleTree::build(leaves.clone()).unwrap();
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(
                    MerkleTree::verify(&tree.root(), leaf, &proof),
                    "leaf {i} of {n}"
                );
            }
        }
    }

    #[test]
    fn test_wrong_leaf_or_index_fails() {
        let leaves = leaves(6);
        let tree = MerkleTree::build(leaves.clone()).unwrap();
        let proof = tree.proof(0).unwrap();
        assert!(!MerkleTree::verify(&tree.root(), &leaves[1], &proof));
        assert!(matches!(
            tree.proof(6),
            Err(RollupError::LeafOutOfRange { index: 6, len: 6 })
        ));
    }

    #[test]
    fn test_pair_hash_is_commutative() {
        let l = leaves(2);
        assert_eq!(hash_pair(&l[0], &l[1]), hash_pair(&l[1], &l[0]));
        assert_eq!(
            MerkleTree::build(l.clone()).unwrap().root(),
            hash_pair(&l[0], &l[1])
        );
    }

    #[test]
    fn test_layout_sorts_leaves() {
        let mut l = leaves(3);
        l.sort();
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &l[2]);
        let forward = MerkleTree::build(l.clone()).unwrap();
        assert_eq!(forward.root(), expected);

        l.reverse();
        let backward = MerkleTree::build(l.clone()).unwrap();
        assert_eq!(backward.root(), expected);
        // Proofs follow the caller's indices, not the sorted ones.
        assert_eq!(backward.proof(0).unwrap(), vec![hash_pair(&l[1], &l[2])]);
        assert_eq!(backward.proof(2).unwrap().len(), 2);
    }
}
