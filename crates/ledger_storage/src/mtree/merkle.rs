//! Canonical entry-level Merkle tree.
//!
//! The index's externally visible root hash is computed over the key-sorted
//! logical entries, not over the physical B+ nodes. Node boundaries depend on
//! split history, so any node-boundary hash would vary with insertion order;
//! hashing the entry sequence makes the root a pure function of the logical
//! content — identical across insertion orders and across compaction.
//!
//! Construction: each entry hashes to `H(ENTRY_TAG ‖ len‖key ‖ len‖value)`;
//! adjacent pairs combine left-to-right as `H(PAIR_TAG ‖ left ‖ right)`, an
//! odd node at any level pairing with itself. Proofs record the sibling hash
//! and the sibling's actual side; concatenation order during verification
//! follows position, never a comparison of hash values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ledger_common::types::Hash256;

/// Domain separation tags. Entry and pair inputs must never collide.
const ENTRY_TAG: u8 = 0x00;
const PAIR_TAG: u8 = 0x01;

/// Hash a logical entry. Key and value are length-prefixed so no two
/// distinct (key, value) pairs share an encoding.
pub fn hash_entry(key: &[u8], value: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([ENTRY_TAG]);
    hasher.update((key.len() as u32).to_be_bytes());
    hasher.update(key);
    hasher.update((value.len() as u32).to_be_bytes());
    hasher.update(value);
    Hash256(hasher.finalize().into())
}

/// Combine two sibling hashes, left first.
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([PAIR_TAG]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash256(hasher.finalize().into())
}

/// Which side of the current hash the sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiblingSide {
    Left,
    Right,
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Hash256,
    pub side: SiblingSide,
}

/// Ordered sibling path from a leaf entry to the root. Produced on demand,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub steps: Vec<ProofStep>,
}

impl Proof {
    /// Fold the proof over a starting leaf hash up to a candidate root.
    pub fn fold(&self, leaf_hash: Hash256) -> Hash256 {
        let mut current = leaf_hash;
        for step in &self.steps {
            current = match step.side {
                SiblingSide::Left => hash_pair(&step.sibling, &current),
                SiblingSide::Right => hash_pair(&current, &step.sibling),
            };
        }
        current
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Verify an inclusion proof. Any mutation of the leaf content or of any
/// hash on the path yields `false`; the engine treats that as a normal
/// result, not an error.
pub fn verify_proof(leaf_hash: Hash256, proof: &Proof, root_hash: Hash256) -> bool {
    if root_hash.is_zero() {
        return false;
    }
    proof.fold(leaf_hash) == root_hash
}

/// Compute the root over a sequence of entry hashes without retaining levels.
pub fn root_over(mut level: Vec<Hash256>) -> Hash256 {
    if level.is_empty() {
        return Hash256::ZERO;
    }
    while level.len() > 1 {
        level = combine_level(&level);
    }
    level[0]
}

fn combine_level(level: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(level.len().div_ceil(2));
    for pair in level.chunks(2) {
        let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
        next.push(hash_pair(&pair[0], right));
    }
    next
}

/// Incrementally maintained Merkle state for one index.
///
/// The sorted keys and their entry hashes are updated on every mutation;
/// the upper levels are rebuilt lazily when the root or a proof is demanded.
#[derive(Debug, Default)]
pub(crate) struct MerkleCache {
    keys: Vec<Vec<u8>>,
    entry_hashes: Vec<Hash256>,
    upper: Vec<Vec<Hash256>>,
    levels_dirty: bool,
}

impl MerkleCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the full entry set (bulk rebuild / decode). Input must be
    /// key-sorted.
    pub(crate) fn reset(&mut self, entries: &[(Vec<u8>, Vec<u8>)]) {
        self.keys = entries.iter().map(|(k, _)| k.clone()).collect();
        self.entry_hashes = entries.iter().map(|(k, v)| hash_entry(k, v)).collect();
        self.upper.clear();
        self.levels_dirty = true;
    }

    /// Record an inserted or updated entry.
    pub(crate) fn upsert(&mut self, key: &[u8], value: &[u8]) {
        let hash = hash_entry(key, value);
        match self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(idx) => self.entry_hashes[idx] = hash,
            Err(idx) => {
                self.keys.insert(idx, key.to_vec());
                self.entry_hashes.insert(idx, hash);
            }
        }
        self.levels_dirty = true;
    }

    /// Record a removed entry.
    pub(crate) fn remove(&mut self, key: &[u8]) {
        if let Ok(idx) = self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            self.keys.remove(idx);
            self.entry_hashes.remove(idx);
            self.levels_dirty = true;
        }
    }

    pub(crate) fn root(&mut self) -> Hash256 {
        self.ensure_levels();
        if self.entry_hashes.is_empty() {
            Hash256::ZERO
        } else if let Some(top) = self.upper.last() {
            top[0]
        } else {
            self.entry_hashes[0]
        }
    }

    /// Inclusion proof for `key`, plus its entry hash.
    pub(crate) fn proof(&mut self, key: &[u8]) -> Option<(Hash256, Proof)> {
        self.ensure_levels();
        let mut idx = self
            .keys
            .binary_search_by(|k| k.as_slice().cmp(key))
            .ok()?;
        let leaf_hash = self.entry_hashes[idx];

        let mut steps = Vec::new();
        let mut level: &[Hash256] = &self.entry_hashes;
        let mut upper_iter = self.upper.iter();
        while level.len() > 1 {
            let sibling_idx = idx ^ 1;
            let (sibling, side) = if sibling_idx >= level.len() {
                // Odd tail: the node pairs with itself on the right.
                (level[idx], SiblingSide::Right)
            } else if sibling_idx < idx {
                (level[sibling_idx], SiblingSide::Left)
            } else {
                (level[sibling_idx], SiblingSide::Right)
            };
            steps.push(ProofStep { sibling, side });
            idx /= 2;
            level = match upper_iter.next() {
                Some(next) => next.as_slice(),
                None => break,
            };
        }

        Some((leaf_hash, Proof { steps }))
    }

    /// Recompute the root from the current entry hashes, bypassing the cached
    /// upper levels. Used by integrity verification.
    pub(crate) fn recomputed_root(&self) -> Hash256 {
        root_over(self.entry_hashes.clone())
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entry_hashes.len()
    }

    fn ensure_levels(&mut self) {
        if !self.levels_dirty {
            return;
        }
        self.upper.clear();
        if self.entry_hashes.len() > 1 {
            let mut level = combine_level(&self.entry_hashes);
            while level.len() > 1 {
                let next = combine_level(&level);
                self.upper.push(level);
                level = next;
            }
            self.upper.push(level);
        }
        self.levels_dirty = false;
    }
}
