//! Simple binary merkle tree over byte slices.
//!
//! Leaves are hashed as `H(0x00 || leaf)` and inner nodes as
//! `H(0x01 || left || right)`. A tree with `n > 1` leaves splits at the
//! largest power of two strictly smaller than `n`.
use serde::{Deserialize, Serialize};

use crate::Hash;

const LEAF_PREFIX: u8 = 0;
const INNER_PREFIX: u8 = 1;

pub fn leaf_hash(leaf: &[u8]) -> Hash {
    Hash::digest_parts(&[&[LEAF_PREFIX], leaf])
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    Hash::digest_parts(&[&[INNER_PREFIX], left.as_bytes(), right.as_bytes()])
}

fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Root hash of `items`. The empty tree hashes to [Hash::ZERO].
pub fn root<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    match items.len() {
        0 => Hash::ZERO,
        1 => leaf_hash(items[0].as_ref()),
        n => {
            let k = split_point(n);
            inner_hash(&root(&items[..k]), &root(&items[k..]))
        }
    }
}

/// Inclusion proof for a single leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub total: usize,
    pub index: usize,
    pub leaf_hash: Hash,
    /// Sibling hashes from the leaf upwards.
    pub aunts: Vec<Hash>,
}

impl Proof {
    /// Checks that `leaf` sits at `self.index` in a tree with root `root`.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> bool {
        if self.index >= self.total || leaf_hash(leaf) != self.leaf_hash {
            return false;
        }
        compute_root(self.index, self.total, self.leaf_hash, &self.aunts).as_ref() == Some(root)
    }
}

fn compute_root(index: usize, total: usize, leaf: Hash, aunts: &[Hash]) -> Option<Hash> {
    match total {
        0 => None,
        1 => aunts.is_empty().then_some(leaf),
        _ => {
            let (outermost, rest) = aunts.split_last()?;
            let k = split_point(total);
            if index < k {
                let left = compute_root(index, k, leaf, rest)?;
                Some(inner_hash(&left, outermost))
            } else {
                let right = compute_root(index - k, total - k, leaf, rest)?;
                Some(inner_hash(outermost, &right))
            }
        }
    }
}

fn aunts_for<T: AsRef<[u8]>>(items: &[T], index: usize) -> Vec<Hash> {
    if items.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(items.len());
    if index < k {
        let mut aunts = aunts_for(&items[..k], index);
        aunts.push(root(&items[k..]));
        aunts
    } else {
        let mut aunts = aunts_for(&items[k..], index - k);
        aunts.push(root(&items[..k]));
        aunts
    }
}

/// Root hash together with one proof per leaf.
pub fn proofs<T: AsRef<[u8]>>(items: &[T]) -> (Hash, Vec<Proof>) {
    let proofs = (0..items.len())
        .map(|index| Proof {
            total: items.len(),
            index,
            leaf_hash: leaf_hash(items[index].as_ref()),
            aunts: aunts_for(items, index),
        })
        .collect();
    (root(items), proofs)
}
