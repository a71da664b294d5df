//! Index nodes and their persisted form.
//!
//! All nodes live in a single growable arena and reference children by
//! integer index, never by owning pointer; the tree carries no cycles and
//! relocates as one unit.
//!
//! Persisted layout (consumed by the external packaging tool):
//! ```text
//!   PersistedIndex:
//!     [magic: 4 bytes "LGRI"] — folded into the bincode header struct
//!     [format_version: u32]
//!     [fan_out: u32] [root: u32] [entry_count: u64]
//!     [nodes: PersistedNode*] — reachable nodes only, depth-first order
//!   PersistedNode:
//!     (type_tag, key_count, keys[], values[] or child_refs[], node_hash)
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ledger_common::types::Hash256;

/// Arena index of a node. Never an owning pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hash-domain tags for node content. Distinct from the entry-level Merkle
/// tags so the two hash planes can never collide.
const LEAF_TAG: u8 = 0x02;
const INTERNAL_TAG: u8 = 0x03;

/// Persisted node type tags.
pub const PERSIST_LEAF_TAG: u8 = 0x00;
pub const PERSIST_INTERNAL_TAG: u8 = 0x01;

/// Magic bytes identifying a persisted index.
pub const INDEX_MAGIC: [u8; 4] = *b"LGRI";

/// Persisted-index format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// A node (leaf or internal) of the hashed ordered index.
///
/// Leaves hold parallel `keys`/`values` lists and chain to the next leaf for
/// range scans. Internal nodes hold separator `keys` and `keys.len() + 1`
/// `children`. `content_hash` is always a pure function of current content;
/// it is only ever set by a recompute pass, never independently.
#[derive(Debug, Clone)]
pub struct HashedNode {
    pub is_leaf: bool,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub children: Vec<NodeId>,
    pub next_leaf: Option<NodeId>,
    pub content_hash: Hash256,
}

impl HashedNode {
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: None,
            content_hash: Hash256::ZERO,
        }
    }

    pub fn new_internal() -> Self {
        Self {
            is_leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: None,
            content_hash: Hash256::ZERO,
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

/// Recompute a node's content hash from its stored content, reading each
/// child's cached hash from the arena.
///
/// Leaf: `H(tag ‖ key_count ‖ (len‖key ‖ len‖value)*)`.
/// Internal: `H(tag ‖ key_count ‖ (len‖key)* ‖ child_content_hash*)`.
pub fn compute_node_hash(node: &HashedNode, arena: &[HashedNode]) -> Hash256 {
    compute_node_hash_via(node, |child| arena[child.index()].content_hash)
}

/// Same scheme, with the child hashes supplied by the caller. Integrity
/// verification passes independently recomputed child hashes so a tampered
/// cached hash cannot vouch for itself.
pub fn compute_node_hash_via<F>(node: &HashedNode, child_hash: F) -> Hash256
where
    F: Fn(NodeId) -> Hash256,
{
    let mut hasher = Sha256::new();
    if node.is_leaf {
        hasher.update([LEAF_TAG]);
        hasher.update((node.keys.len() as u32).to_be_bytes());
        for (key, value) in node.keys.iter().zip(node.values.iter()) {
            hasher.update((key.len() as u32).to_be_bytes());
            hasher.update(key);
            hasher.update((value.len() as u32).to_be_bytes());
            hasher.update(value);
        }
    } else {
        hasher.update([INTERNAL_TAG]);
        hasher.update((node.keys.len() as u32).to_be_bytes());
        for key in &node.keys {
            hasher.update((key.len() as u32).to_be_bytes());
            hasher.update(key);
        }
        for child in &node.children {
            hasher.update(child_hash(*child).0);
        }
    }
    Hash256(hasher.finalize().into())
}

/// Serialized form of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedNode {
    pub type_tag: u8,
    pub key_count: u32,
    pub keys: Vec<Vec<u8>>,
    /// Leaf payloads; empty for internal nodes.
    pub values: Vec<Vec<u8>>,
    /// Child arena references; empty for leaves.
    pub child_refs: Vec<u32>,
    pub node_hash: Hash256,
}

/// Serialized form of a whole index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub magic: [u8; 4],
    pub format_version: u32,
    pub fan_out: u32,
    pub root: u32,
    pub entry_count: u64,
    pub nodes: Vec<PersistedNode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_hash_depends_on_content() {
        let arena: Vec<HashedNode> = Vec::new();
        let mut leaf = HashedNode::new_leaf();
        leaf.keys.push(b"a".to_vec());
        leaf.values.push(b"1".to_vec());
        let h1 = compute_node_hash(&leaf, &arena);

        leaf.values[0] = b"2".to_vec();
        let h2 = compute_node_hash(&leaf, &arena);
        assert_ne!(h1, h2);

        leaf.values[0] = b"1".to_vec();
        assert_eq!(compute_node_hash(&leaf, &arena), h1);
    }

    #[test]
    fn test_length_prefixing_prevents_boundary_ambiguity() {
        let arena: Vec<HashedNode> = Vec::new();
        let mut a = HashedNode::new_leaf();
        a.keys.push(b"ab".to_vec());
        a.values.push(b"c".to_vec());

        let mut b = HashedNode::new_leaf();
        b.keys.push(b"a".to_vec());
        b.values.push(b"bc".to_vec());

        assert_ne!(compute_node_hash(&a, &arena), compute_node_hash(&b, &arena));
    }

    #[test]
    fn test_internal_hash_reads_child_hashes() {
        let mut arena = vec![HashedNode::new_leaf(), HashedNode::new_leaf()];
        arena[0].keys.push(b"a".to_vec());
        arena[0].values.push(b"1".to_vec());
        arena[1].keys.push(b"m".to_vec());
        arena[1].values.push(b"2".to_vec());
        for node in arena.iter_mut() {
            node.content_hash = compute_node_hash_via(node, |_| Hash256::ZERO);
        }

        let mut internal = HashedNode::new_internal();
        internal.keys.push(b"m".to_vec());
        internal.children.push(NodeId(0));
        internal.children.push(NodeId(1));
        let h1 = compute_node_hash(&internal, &arena);

        // Tampering a child's cached hash changes the parent hash.
        arena[1].content_hash.0[0] ^= 0xFF;
        let h2 = compute_node_hash(&internal, &arena);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_leaf_and_internal_domains_are_separated() {
        let arena: Vec<HashedNode> = Vec::new();
        let leaf = HashedNode::new_leaf();
        let internal = HashedNode::new_internal();
        assert_ne!(
            compute_node_hash(&leaf, &arena),
            compute_node_hash(&internal, &arena)
        );
    }
}
