//! Merkle tree over byte slices, used to commit to the parts of a block.
//! Leaf and inner nodes are domain-separated so that a leaf can never be
//! reinterpreted as an inner node.
use super::Hash;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update(leaf);
    Hash(h.finalize().into())
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = Sha256::new();
    h.update([INNER_PREFIX]);
    h.update(left.0);
    h.update(right.0);
    Hash(h.finalize().into())
}

/// Largest power of two strictly less than `n`.
fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut p = 1;
    while p * 2 < n {
        p *= 2;
    }
    p
}

fn root_of_hashes(hashes: &[Hash]) -> Hash {
    match hashes.len() {
        0 => Hash::sha256(&[]),
        1 => hashes[0],
        n => {
            let split = split_point(n);
            let left = root_of_hashes(&hashes[..split]);
            let right = root_of_hashes(&hashes[split..]);
            inner_hash(&left, &right)
        }
    }
}

/// Root of the tree over the given leaves.
pub fn root(leaves: impl Iterator<Item = impl AsRef<[u8]>>) -> Hash {
    let hashes: Vec<_> = leaves.map(|l| leaf_hash(l.as_ref())).collect();
    root_of_hashes(&hashes)
}

/// Computes the root together with one inclusion proof per leaf.
pub fn proofs(leaves: impl Iterator<Item = impl AsRef<[u8]>>) -> (Hash, Vec<Proof>) {
    let hashes: Vec<_> = leaves.map(|l| leaf_hash(l.as_ref())).collect();
    let total = hashes.len();
    let mut proofs: Vec<_> = hashes
        .iter()
        .enumerate()
        .map(|(index, &leaf_hash)| Proof {
            total: total as u32,
            index: index as u32,
            leaf_hash,
            aunts: Vec::new(),
        })
        .collect();
    let root = fill_aunts(&hashes, &mut proofs, 0);
    (root, proofs)
}

// Recursively computes the subtree root over hashes[..] (offset by `base`
// leaves in the full tree) while pushing sibling hashes onto the proofs of
// the leaves inside the subtree. Aunts end up ordered leaf-to-root.
fn fill_aunts(hashes: &[Hash], proofs: &mut [Proof], base: usize) -> Hash {
    match hashes.len() {
        0 => Hash::sha256(&[]),
        1 => hashes[0],
        n => {
            let split = split_point(n);
            let left = fill_aunts(&hashes[..split], proofs, base);
            let right = fill_aunts(&hashes[split..], proofs, base + split);
            for p in &mut proofs[base..base + split] {
                p.aunts.push(right);
            }
            for p in &mut proofs[base + split..base + n] {
                p.aunts.push(left);
            }
            inner_hash(&left, &right)
        }
    }
}

/// Inclusion proof of a single leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Total number of leaves in the tree.
    pub total: u32,
    /// Index of the proven leaf.
    pub index: u32,
    /// Hash of the proven leaf.
    pub leaf_hash: Hash,
    /// Sibling subtree hashes, ordered leaf-to-root.
    pub aunts: Vec<Hash>,
}

impl Proof {
    /// Verifies that `leaf` is the leaf at `self.index` of a tree with
    /// the given root.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> Result<(), InvalidProofError> {
        if self.leaf_hash != leaf_hash(leaf) {
            return Err(InvalidProofError);
        }
        let computed = compute_root_from_aunts(
            self.index as usize,
            self.total as usize,
            self.leaf_hash,
            &self.aunts,
        )?;
        if computed != *root {
            return Err(InvalidProofError);
        }
        Ok(())
    }
}

// The aunt at the end of the list is the sibling at the top split, so the
// recursion peels aunts from the back while narrowing the leaf range.
fn compute_root_from_aunts(
    index: usize,
    total: usize,
    leaf_hash: Hash,
    aunts: &[Hash],
) -> Result<Hash, InvalidProofError> {
    match total {
        0 => Err(InvalidProofError),
        1 => {
            if !aunts.is_empty() || index != 0 {
                return Err(InvalidProofError);
            }
            Ok(leaf_hash)
        }
        _ => {
            if index >= total {
                return Err(InvalidProofError);
            }
            let (aunt, rest) = aunts.split_last().ok_or(InvalidProofError)?;
            let split = split_point(total);
            if index < split {
                let left = compute_root_from_aunts(index, split, leaf_hash, rest)?;
                Ok(inner_hash(&left, aunt))
            } else {
                let right =
                    compute_root_from_aunts(index - split, total - split, leaf_hash, rest)?;
                Ok(inner_hash(aunt, &right))
            }
        }
    }
}

/// Error returned when a Merkle proof does not check out.
#[derive(Debug, thiserror::Error)]
#[error("invalid merkle proof")]
pub struct InvalidProofError;
