//! Binary Merkle tree over a sorted asset-ID set.
//!
//! Leaf hashes are the asset IDs themselves (already BLAKE3 digests).
//! An internal node is `BLAKE3(left_hex + ":" + right_hex)` in hex. An
//! unpaired node at the end of a level is promoted by pairing with itself.
//! The empty set hashes to `BLAKE3("")`.
//!
//! Determinism of the sort and of the concatenation order is load-bearing:
//! snapshot identity is derived from the root hash.

use serde_derive::{Deserialize, Serialize};

/// Which side of the pair a proof sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof: the sibling hash and its side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub side: Side,
}

/// A Merkle tree with all levels retained, leaves at level 0.
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

fn hash_pair(left: &str, right: &str) -> String {
    blake3::hash(format!("{}:{}", left, right).as_bytes())
        .to_hex()
        .to_string()
}

impl MerkleTree {
    /// Builds the tree. IDs are sorted and deduplicated; the caller's order
    /// does not matter.
    pub fn new<S: AsRef<str>>(asset_ids: &[S]) -> Self {
        let mut leaves: Vec<String> = asset_ids.iter().map(|s| s.as_ref().to_string()).collect();
        leaves.sort();
        leaves.dedup();

        let mut levels = vec![leaves];
        loop {
            let current = match levels.last() {
                Some(level) if level.len() > 1 => level,
                _ => break,
            };
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(hash_pair(left, right));
            }
            levels.push(next);
        }
        MerkleTree { levels }
    }

    /// The root hash. A single leaf is its own root; the empty tree hashes
    /// the empty string.
    pub fn root(&self) -> String {
        match self.levels.last().and_then(|level| level.first()) {
            Some(root) => root.clone(),
            None => blake3::hash(b"").to_hex().to_string(),
        }
    }

    /// The number of leaves.
    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, |leaves| leaves.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds an inclusion proof for `asset_id`, or None if it is not a leaf.
    pub fn proof(&self, asset_id: &str) -> Option<Vec<ProofStep>> {
        let leaves = self.levels.first()?;
        let mut index = leaves.binary_search_by(|leaf| leaf.as_str().cmp(asset_id)).ok()?;

        let mut steps = Vec::new();
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let (sibling_index, side) = if index % 2 == 0 {
                (index + 1, Side::Right)
            } else {
                (index - 1, Side::Left)
            };
            // An unpaired trailing node is its own sibling.
            let sibling = level.get(sibling_index).unwrap_or(&level[index]);
            steps.push(ProofStep { sibling: sibling.clone(), side });
            index /= 2;
        }
        Some(steps)
    }

    /// Folds `proof` over `asset_id` and compares against `root`.
    pub fn verify_proof(asset_id: &str, proof: &[ProofStep], root: &str) -> bool {
        let mut current = asset_id.to_string();
        for step in proof {
            current = match step.side {
                Side::Right => hash_pair(&current, &step.sibling),
                Side::Left => hash_pair(&step.sibling, &current),
            };
        }
        current == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| blake3::hash(format!("asset-{}", i).as_bytes()).to_hex().to_string())
            .collect()
    }

    #[test]
    fn empty_root_is_blake3_of_empty() {
        let tree = MerkleTree::new::<String>(&[]);
        assert_eq!(tree.root(), blake3::hash(b"").to_hex().to_string());
        assert!(tree.proof("00").is_none());
    }

    #[test]
    fn single_member_root_is_the_member() {
        let ids = ids(1);
        let tree = MerkleTree::new(&ids);
        assert_eq!(tree.root(), ids[0]);
        let proof = tree.proof(&ids[0]).unwrap();
        assert!(proof.is_empty());
        assert!(MerkleTree::verify_proof(&ids[0], &proof, &tree.root()));
    }

    #[test]
    fn root_is_order_independent() {
        let mut ids = ids(7);
        let root = MerkleTree::new(&ids).root();
        ids.reverse();
        assert_eq!(MerkleTree::new(&ids).root(), root);
        // Duplicates collapse into the set.
        let mut doubled = ids.clone();
        doubled.extend(ids.clone());
        assert_eq!(MerkleTree::new(&doubled).root(), root);
    }

    #[test]
    fn proofs_verify_for_every_member() {
        for n in [2, 3, 4, 5, 8, 13] {
            let ids = ids(n);
            let tree = MerkleTree::new(&ids);
            let root = tree.root();
            for id in &ids {
                let proof = tree.proof(id).unwrap();
                assert!(
                    MerkleTree::verify_proof(id, &proof, &root),
                    "proof failed for member of a {}-leaf tree",
                    n
                );
            }
        }
    }

    #[test]
    fn tampered_proof_fails() {
        let ids = ids(5);
        let tree = MerkleTree::new(&ids);
        let root = tree.root();
        let mut proof = tree.proof(&ids[2]).unwrap();

        // Wrong leaf.
        assert!(!MerkleTree::verify_proof(&ids[3], &proof, &root));
        // Flipped side.
        proof[0].side = match proof[0].side {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        };
        assert!(!MerkleTree::verify_proof(&ids[2], &proof, &root));
    }

    #[test]
    fn unknown_member_has_no_proof() {
        let tree = MerkleTree::new(&ids(4));
        assert!(tree.proof("ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff").is_none());
    }

    #[test]
    fn odd_level_duplicates_unpaired_node() {
        let ids = ids(3);
        let tree = MerkleTree::new(&ids);
        let mut sorted = ids.clone();
        sorted.sort();
        let left = super::hash_pair(&sorted[0], &sorted[1]);
        let right = super::hash_pair(&sorted[2], &sorted[2]);
        assert_eq!(tree.root(), super::hash_pair(&left, &right));
    }
}
