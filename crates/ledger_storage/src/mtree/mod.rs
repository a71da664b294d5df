//! Hashed ordered index — a Merkle B+ tree over a node arena.
//!
//! A dynamic sorted key→value structure in which every node carries a content
//! hash and the whole index exposes a single root hash. Two hash planes:
//!
//! - **Node content hashes** (leaf = keys+values, internal = keys+child
//!   hashes) are recomputed bottom-up along the modified path after every
//!   mutation and give tamper evidence for the physical structure.
//! - **The exposed root hash** is the canonical entry-level Merkle root
//!   (see `merkle`), a pure function of the logical content: identical for
//!   any insertion order and unchanged by compaction.
//!
//! Nodes live in a growable arena addressed by `NodeId`; slots vacated by
//! merges go on a free list. The fragmentation metric the compaction engine
//! watches combines the free-slot ratio with leaf slack (see
//! [`HashedOrderedIndex::fragmentation`]).

pub mod compaction;
pub mod merkle;
pub mod node;

use std::collections::HashMap;
use std::ops::Bound;

use parking_lot::Mutex;

use ledger_common::error::{LedgerError, LedgerResult};
use ledger_common::types::Hash256;

use self::merkle::{hash_entry, MerkleCache, Proof};
use self::node::{
    compute_node_hash, compute_node_hash_via, HashedNode, NodeId, PersistedIndex, PersistedNode,
    INDEX_FORMAT_VERSION, INDEX_MAGIC, PERSIST_INTERNAL_TAG, PERSIST_LEAF_TAG,
};

/// Smallest usable fan-out: below 4 splits cannot produce two valid halves.
pub const MIN_FAN_OUT: usize = 4;

/// Dynamic sorted key→value index with per-node content hashes and a
/// layout-independent Merkle root.
#[derive(Debug)]
pub struct HashedOrderedIndex {
    arena: Vec<HashedNode>,
    free: Vec<NodeId>,
    root: NodeId,
    fan_out: usize,
    len: usize,
    leaf_count: usize,
    mutations: u64,
    merkle: Mutex<MerkleCache>,
}

impl HashedOrderedIndex {
    /// Create an empty index with the given fan-out bound M.
    pub fn new(fan_out: usize) -> Self {
        assert!(fan_out >= MIN_FAN_OUT, "fan-out must be at least {}", MIN_FAN_OUT);
        Self {
            arena: vec![HashedNode::new_leaf()],
            free: Vec::new(),
            root: NodeId(0),
            fan_out,
            len: 0,
            leaf_count: 1,
            mutations: 0,
            merkle: Mutex::new(MerkleCache::new()),
        }
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total mutating operations performed over the index's lifetime.
    /// Survives compaction; the compaction engine measures reorganization
    /// intervals against it.
    pub fn mutations(&self) -> u64 {
        self.mutations
    }

    /// Arena slots currently allocated (live + free).
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Live node count.
    pub fn node_count(&self) -> usize {
        self.arena.len() - self.free.len()
    }

    /// Fragmentation metric watched by the compaction engine: the larger of
    /// the dead-slot ratio (arena slots on the free list) and the leaf slack
    /// ratio (capacity left unused in live leaves by splits and deletes).
    pub fn fragmentation(&self) -> f64 {
        if self.arena.is_empty() {
            return 0.0;
        }
        let dead = self.free.len() as f64 / self.arena.len() as f64;
        let slack = if self.len == 0 || self.leaf_count <= 1 {
            0.0
        } else {
            let capacity = (self.leaf_count * self.leaf_max_keys()) as f64;
            1.0 - self.len as f64 / capacity
        };
        dead.max(slack)
    }

    /// Insert or update an entry; returns the new root hash.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Hash256 {
        self.mutations += 1;

        let (leaf_id, path) = self.descend(key);
        {
            let leaf = &mut self.arena[leaf_id.index()];
            match leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
                Ok(i) => leaf.values[i] = value.to_vec(),
                Err(i) => {
                    leaf.keys.insert(i, key.to_vec());
                    leaf.values.insert(i, value.to_vec());
                    self.len += 1;
                }
            }
        }
        self.merkle.get_mut().upsert(key, value);
        self.rehash(leaf_id);

        let mut pending = if self.is_overfull(leaf_id) {
            Some(self.split(leaf_id))
        } else {
            None
        };

        for &(parent_id, child_idx) in path.iter().rev() {
            if let Some((sep, right_id)) = pending.take() {
                let parent = &mut self.arena[parent_id.index()];
                parent.keys.insert(child_idx, sep);
                parent.children.insert(child_idx + 1, right_id);
                if self.is_overfull(parent_id) {
                    pending = Some(self.split(parent_id));
                    continue;
                }
            }
            self.rehash(parent_id);
        }

        if let Some((sep, right_id)) = pending {
            let mut new_root = HashedNode::new_internal();
            new_root.keys.push(sep);
            new_root.children.push(self.root);
            new_root.children.push(right_id);
            let new_root_id = self.alloc(new_root);
            self.rehash(new_root_id);
            self.root = new_root_id;
        }

        self.root_hash()
    }

    /// Point lookup. A missing key is a normal result, not an error.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let leaf_id = self.find_leaf(key);
        let leaf = &self.arena[leaf_id.index()];
        leaf.keys
            .binary_search_by(|k| k.as_slice().cmp(key))
            .ok()
            .map(|i| leaf.values[i].as_slice())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Remove an entry; returns whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let (leaf_id, path) = self.descend(key);
        {
            let leaf = &mut self.arena[leaf_id.index()];
            let Ok(i) = leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) else {
                return false;
            };
            leaf.keys.remove(i);
            leaf.values.remove(i);
        }
        self.mutations += 1;
        self.len -= 1;
        self.merkle.get_mut().remove(key);
        self.rehash(leaf_id);

        let mut node_id = leaf_id;
        for depth in (0..path.len()).rev() {
            let (parent_id, child_idx) = path[depth];
            if self.is_underfull(node_id) {
                self.fix_underflow(parent_id, child_idx);
            }
            self.rehash(parent_id);
            node_id = parent_id;
        }

        // Root shrink: an internal root left with a single child hands the
        // root role down.
        let root = &self.arena[self.root.index()];
        if !root.is_leaf && root.children.len() == 1 {
            let new_root = root.children[0];
            let old_root = self.root;
            self.free(old_root);
            self.root = new_root;
        }

        true
    }

    /// Ordered scan over `[start, end]` per the given bounds.
    pub fn range(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        if self.len == 0 {
            return out;
        }
        let mut leaf = Some(match start {
            Bound::Unbounded => self.first_leaf(),
            Bound::Included(k) | Bound::Excluded(k) => self.find_leaf(k),
        });
        while let Some(id) = leaf {
            let node = &self.arena[id.index()];
            for (k, v) in node.keys.iter().zip(node.values.iter()) {
                let after_start = match start {
                    Bound::Unbounded => true,
                    Bound::Included(s) => k.as_slice() >= s,
                    Bound::Excluded(s) => k.as_slice() > s,
                };
                if !after_start {
                    continue;
                }
                let before_end = match end {
                    Bound::Unbounded => true,
                    Bound::Included(e) => k.as_slice() <= e,
                    Bound::Excluded(e) => k.as_slice() < e,
                };
                if !before_end {
                    return out;
                }
                out.push((k.clone(), v.clone()));
            }
            leaf = node.next_leaf;
        }
        out
    }

    /// All entries in key order (in-order traversal of the leaf chain).
    /// Always walks the tree, so a stored entry count cannot vouch for
    /// itself during verification.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.len);
        let mut leaf = Some(self.first_leaf());
        while let Some(id) = leaf {
            let node = &self.arena[id.index()];
            for (k, v) in node.keys.iter().zip(node.values.iter()) {
                out.push((k.clone(), v.clone()));
            }
            leaf = node.next_leaf;
        }
        out
    }

    /// The canonical root hash over the current logical content.
    /// All-zero for an empty index.
    pub fn root_hash(&self) -> Hash256 {
        self.merkle.lock().root()
    }

    /// Inclusion proof for `key`: its entry hash plus the sibling path to the
    /// root. `None` if the key is absent.
    pub fn proof_for_key(&self, key: &[u8]) -> Option<(Hash256, Proof)> {
        self.merkle.lock().proof(key)
    }

    /// Recompute every reachable node's hash from stored content and verify
    /// structure and ordering. Returns `false` on any tamper; the caller
    /// treats that as fatal for further writes until the index is rebuilt
    /// from an authoritative log.
    pub fn verify_integrity(&self) -> bool {
        let mut true_hashes: Vec<Option<Hash256>> = vec![None; self.arena.len()];
        let mut visited = vec![false; self.arena.len()];

        enum Frame {
            Enter(NodeId),
            Exit(NodeId),
        }
        let mut stack = vec![Frame::Enter(self.root)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    if id.index() >= self.arena.len() || visited[id.index()] {
                        return false;
                    }
                    visited[id.index()] = true;
                    let node = &self.arena[id.index()];
                    if node.is_leaf {
                        if node.keys.len() != node.values.len() || !node.children.is_empty() {
                            return false;
                        }
                    } else {
                        if node.children.len() != node.keys.len() + 1 || !node.values.is_empty() {
                            return false;
                        }
                        for child in &node.children {
                            if child.index() >= self.arena.len() {
                                return false;
                            }
                        }
                    }
                    if !node.keys.windows(2).all(|w| w[0] < w[1]) {
                        return false;
                    }
                    stack.push(Frame::Exit(id));
                    if !node.is_leaf {
                        for child in node.children.iter().rev() {
                            stack.push(Frame::Enter(*child));
                        }
                    }
                }
                Frame::Exit(id) => {
                    let node = &self.arena[id.index()];
                    let recomputed = compute_node_hash_via(node, |child| {
                        true_hashes[child.index()].unwrap_or(Hash256::ZERO)
                    });
                    if recomputed != node.content_hash {
                        return false;
                    }
                    true_hashes[id.index()] = Some(recomputed);
                }
            }
        }

        // Logical entries: globally ordered and consistent with the
        // entry-level Merkle state.
        let entries = self.entries();
        if entries.len() != self.len {
            return false;
        }
        if !entries.windows(2).all(|w| w[0].0 < w[1].0) {
            return false;
        }
        let fresh_root =
            merkle::root_over(entries.iter().map(|(k, v)| hash_entry(k, v)).collect());
        let cache = self.merkle.lock();
        cache.entry_count() == entries.len() && cache.recomputed_root() == fresh_root
    }

    /// Bulk-build from a strictly key-sorted entry set, computing all hashes
    /// once over the finished structure. Used by compaction and recovery.
    pub fn bulk_from_entries(
        fan_out: usize,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> LedgerResult<Self> {
        if !entries.windows(2).all(|w| w[0].0 < w[1].0) {
            return Err(LedgerError::Internal(
                "bulk build requires strictly sorted, duplicate-free input".into(),
            ));
        }
        let mut index = Self::new(fan_out);
        if entries.is_empty() {
            return Ok(index);
        }

        index.merkle.get_mut().reset(&entries);
        index.len = entries.len();
        index.arena.clear();
        index.root = NodeId(0);
        index.leaf_count = 0;

        // Leaf level: spread entries evenly so every leaf meets minimum
        // occupancy.
        let leaf_cap = fan_out - 1;
        let n = entries.len();
        let num_leaves = n.div_ceil(leaf_cap);
        let mut level: Vec<(NodeId, Vec<u8>)> = Vec::with_capacity(num_leaves);
        let mut iter = entries.into_iter();
        let mut remaining = n;
        let mut prev_leaf: Option<NodeId> = None;
        for slot in 0..num_leaves {
            let take = remaining.div_ceil(num_leaves - slot);
            let mut leaf = HashedNode::new_leaf();
            for _ in 0..take {
                let (k, v) = iter.next().expect("entry count mismatch");
                leaf.keys.push(k);
                leaf.values.push(v);
            }
            remaining -= take;
            let first_key = leaf.keys[0].clone();
            let id = NodeId(index.arena.len() as u32);
            index.arena.push(leaf);
            if let Some(prev) = prev_leaf {
                index.arena[prev.index()].next_leaf = Some(id);
            }
            prev_leaf = Some(id);
            index.leaf_count += 1;
            index.rehash(id);
            level.push((id, first_key));
        }

        // Internal levels, bottom-up.
        while level.len() > 1 {
            let num_parents = level.len().div_ceil(fan_out);
            let mut next_level: Vec<(NodeId, Vec<u8>)> = Vec::with_capacity(num_parents);
            let mut children = level.into_iter();
            let mut remaining = children.len();
            for slot in 0..num_parents {
                let take = remaining.div_ceil(num_parents - slot);
                let mut parent = HashedNode::new_internal();
                let mut first_key: Option<Vec<u8>> = None;
                for i in 0..take {
                    let (child_id, child_first) = children.next().expect("level count mismatch");
                    parent.children.push(child_id);
                    if i == 0 {
                        first_key = Some(child_first);
                    } else {
                        parent.keys.push(child_first);
                    }
                }
                remaining -= take;
                let id = NodeId(index.arena.len() as u32);
                index.arena.push(parent);
                index.rehash(id);
                next_level.push((id, first_key.expect("parent without children")));
            }
            level = next_level;
        }

        index.root = level[0].0;
        Ok(index)
    }

    /// Swap in a rebuilt replacement, keeping the lifetime mutation counter.
    pub(crate) fn adopt(&mut self, replacement: HashedOrderedIndex) {
        let mutations = self.mutations;
        *self = replacement;
        self.mutations = mutations;
    }

    /// Serialize the reachable tree (persisted layout consumed by the
    /// external packaging tool).
    pub fn encode(&self) -> LedgerResult<Vec<u8>> {
        let mut remap: HashMap<u32, u32> = HashMap::new();
        let mut order: Vec<NodeId> = Vec::with_capacity(self.node_count());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if remap.contains_key(&id.0) {
                continue;
            }
            remap.insert(id.0, order.len() as u32);
            order.push(id);
            let node = &self.arena[id.index()];
            for child in node.children.iter().rev() {
                stack.push(*child);
            }
        }

        let nodes = order
            .iter()
            .map(|id| {
                let node = &self.arena[id.index()];
                PersistedNode {
                    type_tag: if node.is_leaf {
                        PERSIST_LEAF_TAG
                    } else {
                        PERSIST_INTERNAL_TAG
                    },
                    key_count: node.keys.len() as u32,
                    keys: node.keys.clone(),
                    values: node.values.clone(),
                    child_refs: node.children.iter().map(|c| remap[&c.0]).collect(),
                    node_hash: node.content_hash,
                }
            })
            .collect();

        let persisted = PersistedIndex {
            magic: INDEX_MAGIC,
            format_version: INDEX_FORMAT_VERSION,
            fan_out: self.fan_out as u32,
            root: remap[&self.root.0],
            entry_count: self.len as u64,
            nodes,
        };
        bincode::serialize(&persisted).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    /// Deserialize a persisted index, verifying structure and hashes before
    /// accepting it.
    pub fn decode(bytes: &[u8]) -> LedgerResult<Self> {
        let persisted: PersistedIndex =
            bincode::deserialize(bytes).map_err(|e| LedgerError::Serialization(e.to_string()))?;
        if persisted.magic != INDEX_MAGIC {
            return Err(LedgerError::Serialization("bad index magic".into()));
        }
        if persisted.format_version != INDEX_FORMAT_VERSION {
            return Err(LedgerError::Serialization(format!(
                "unsupported index format version {}",
                persisted.format_version
            )));
        }
        let fan_out = persisted.fan_out as usize;
        if fan_out < MIN_FAN_OUT {
            return Err(LedgerError::Serialization("fan-out below minimum".into()));
        }
        let count = persisted.nodes.len();
        if count == 0 || persisted.root as usize >= count {
            return Err(LedgerError::Serialization("bad root reference".into()));
        }

        let mut arena = Vec::with_capacity(count);
        for pn in persisted.nodes {
            let is_leaf = match pn.type_tag {
                PERSIST_LEAF_TAG => true,
                PERSIST_INTERNAL_TAG => false,
                other => {
                    return Err(LedgerError::Serialization(format!(
                        "unknown node type tag {:#04x}",
                        other
                    )))
                }
            };
            if pn.key_count as usize != pn.keys.len() {
                return Err(LedgerError::Serialization("key count mismatch".into()));
            }
            if is_leaf && pn.keys.len() != pn.values.len() {
                return Err(LedgerError::Serialization("leaf arity mismatch".into()));
            }
            if !is_leaf && pn.child_refs.len() != pn.keys.len() + 1 {
                return Err(LedgerError::Serialization("internal arity mismatch".into()));
            }
            if pn.child_refs.iter().any(|&r| r as usize >= count) {
                return Err(LedgerError::Serialization("child reference out of range".into()));
            }
            arena.push(HashedNode {
                is_leaf,
                keys: pn.keys,
                values: pn.values,
                children: pn.child_refs.into_iter().map(NodeId).collect(),
                next_leaf: None,
                content_hash: pn.node_hash,
            });
        }

        let mut index = Self {
            arena,
            free: Vec::new(),
            root: NodeId(persisted.root),
            fan_out,
            len: persisted.entry_count as usize,
            leaf_count: 0,
            mutations: 0,
            merkle: Mutex::new(MerkleCache::new()),
        };
        index.relink_leaves();
        let entries = index.entries();
        if entries.len() != index.len {
            return Err(LedgerError::Serialization("entry count mismatch".into()));
        }
        index.merkle.get_mut().reset(&entries);
        if !index.verify_integrity() {
            return Err(LedgerError::Serialization(
                "integrity verification failed after decode".into(),
            ));
        }
        Ok(index)
    }

    // ── internals ────────────────────────────────────────────────────────

    fn leaf_max_keys(&self) -> usize {
        self.fan_out - 1
    }

    fn min_leaf_keys(&self) -> usize {
        (self.fan_out - 1) / 2
    }

    fn min_internal_children(&self) -> usize {
        self.fan_out.div_ceil(2)
    }

    fn is_overfull(&self, id: NodeId) -> bool {
        let node = &self.arena[id.index()];
        if node.is_leaf {
            node.keys.len() > self.leaf_max_keys()
        } else {
            node.children.len() > self.fan_out
        }
    }

    fn is_underfull(&self, id: NodeId) -> bool {
        let node = &self.arena[id.index()];
        if node.is_leaf {
            node.keys.len() < self.min_leaf_keys()
        } else {
            node.children.len() < self.min_internal_children()
        }
    }

    fn can_lend(&self, id: NodeId) -> bool {
        let node = &self.arena[id.index()];
        if node.is_leaf {
            node.keys.len() > self.min_leaf_keys()
        } else {
            node.children.len() > self.min_internal_children()
        }
    }

    fn alloc(&mut self, node: HashedNode) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.arena[id.index()] = node;
                id
            }
            None => {
                self.arena.push(node);
                NodeId((self.arena.len() - 1) as u32)
            }
        }
    }

    fn free(&mut self, id: NodeId) {
        self.arena[id.index()] = HashedNode::new_leaf();
        self.free.push(id);
    }

    fn rehash(&mut self, id: NodeId) {
        let hash = compute_node_hash(&self.arena[id.index()], &self.arena);
        self.arena[id.index()].content_hash = hash;
    }

    fn find_leaf(&self, key: &[u8]) -> NodeId {
        let mut current = self.root;
        loop {
            let node = &self.arena[current.index()];
            if node.is_leaf {
                return current;
            }
            let idx = node.keys.partition_point(|k| k.as_slice() <= key);
            current = node.children[idx];
        }
    }

    fn first_leaf(&self) -> NodeId {
        let mut current = self.root;
        loop {
            let node = &self.arena[current.index()];
            if node.is_leaf {
                return current;
            }
            current = node.children[0];
        }
    }

    /// Root-to-leaf descent recording (node, taken child index) per level.
    fn descend(&self, key: &[u8]) -> (NodeId, Vec<(NodeId, usize)>) {
        let mut path = Vec::new();
        let mut current = self.root;
        loop {
            let node = &self.arena[current.index()];
            if node.is_leaf {
                return (current, path);
            }
            let idx = node.keys.partition_point(|k| k.as_slice() <= key);
            path.push((current, idx));
            current = node.children[idx];
        }
    }

    /// Split an overfull node; returns (separator, new right sibling).
    /// Both halves are rehashed.
    fn split(&mut self, node_id: NodeId) -> (Vec<u8>, NodeId) {
        let is_leaf = self.arena[node_id.index()].is_leaf;
        if is_leaf {
            let (sep, right, old_next) = {
                let node = &mut self.arena[node_id.index()];
                let mid = node.keys.len() / 2;
                let right_keys = node.keys.split_off(mid);
                let right_values = node.values.split_off(mid);
                let sep = right_keys[0].clone();
                let mut right = HashedNode::new_leaf();
                right.keys = right_keys;
                right.values = right_values;
                (sep, right, node.next_leaf)
            };
            let right_id = self.alloc(right);
            self.arena[right_id.index()].next_leaf = old_next;
            self.arena[node_id.index()].next_leaf = Some(right_id);
            self.leaf_count += 1;
            self.rehash(node_id);
            self.rehash(right_id);
            (sep, right_id)
        } else {
            let (sep, right) = {
                let node = &mut self.arena[node_id.index()];
                let mid = node.keys.len() / 2;
                let right_keys = node.keys.split_off(mid + 1);
                let sep = node.keys.pop().expect("split of node without keys");
                let right_children = node.children.split_off(mid + 1);
                let mut right = HashedNode::new_internal();
                right.keys = right_keys;
                right.children = right_children;
                (sep, right)
            };
            let right_id = self.alloc(right);
            self.rehash(node_id);
            self.rehash(right_id);
            (sep, right_id)
        }
    }

    /// Repair an underfull child of `parent_id`: borrow from a sibling if one
    /// can lend, otherwise merge. Modified siblings are rehashed here; the
    /// parent is rehashed by the caller's upward walk.
    fn fix_underflow(&mut self, parent_id: NodeId, child_idx: usize) {
        let child_id = self.arena[parent_id.index()].children[child_idx];
        let child_count = self.arena[parent_id.index()].children.len();

        if child_idx > 0 {
            let left_id = self.arena[parent_id.index()].children[child_idx - 1];
            if self.can_lend(left_id) {
                self.borrow_from_left(parent_id, child_idx, left_id, child_id);
                return;
            }
        }
        if child_idx + 1 < child_count {
            let right_id = self.arena[parent_id.index()].children[child_idx + 1];
            if self.can_lend(right_id) {
                self.borrow_from_right(parent_id, child_idx, child_id, right_id);
                return;
            }
        }
        if child_idx > 0 {
            self.merge_children(parent_id, child_idx - 1);
        } else if child_count > 1 {
            self.merge_children(parent_id, child_idx);
        }
    }

    fn borrow_from_left(
        &mut self,
        parent_id: NodeId,
        child_idx: usize,
        left_id: NodeId,
        child_id: NodeId,
    ) {
        let is_leaf = self.arena[child_id.index()].is_leaf;
        if is_leaf {
            let moved_key = {
                let (left, child) = self.two_mut(left_id, child_id);
                let key = left.keys.pop().expect("lending leaf is empty");
                let value = left.values.pop().expect("lending leaf is empty");
                child.keys.insert(0, key.clone());
                child.values.insert(0, value);
                key
            };
            self.arena[parent_id.index()].keys[child_idx - 1] = moved_key;
        } else {
            let sep = self.arena[parent_id.index()].keys[child_idx - 1].clone();
            let promoted = {
                let (left, child) = self.two_mut(left_id, child_id);
                let moved_child = left.children.pop().expect("lending node is empty");
                let promoted = left.keys.pop().expect("lending node is empty");
                child.keys.insert(0, sep);
                child.children.insert(0, moved_child);
                promoted
            };
            self.arena[parent_id.index()].keys[child_idx - 1] = promoted;
        }
        self.rehash(left_id);
        self.rehash(child_id);
    }

    fn borrow_from_right(
        &mut self,
        parent_id: NodeId,
        child_idx: usize,
        child_id: NodeId,
        right_id: NodeId,
    ) {
        let is_leaf = self.arena[child_id.index()].is_leaf;
        if is_leaf {
            let new_sep = {
                let (child, right) = self.two_mut(child_id, right_id);
                let key = right.keys.remove(0);
                let value = right.values.remove(0);
                child.keys.push(key);
                child.values.push(value);
                right.keys[0].clone()
            };
            self.arena[parent_id.index()].keys[child_idx] = new_sep;
        } else {
            let sep = self.arena[parent_id.index()].keys[child_idx].clone();
            let promoted = {
                let (child, right) = self.two_mut(child_id, right_id);
                child.keys.push(sep);
                child.children.push(right.children.remove(0));
                right.keys.remove(0)
            };
            self.arena[parent_id.index()].keys[child_idx] = promoted;
        }
        self.rehash(child_id);
        self.rehash(right_id);
    }

    /// Merge `children[left_pos + 1]` into `children[left_pos]`, dropping the
    /// separator between them and freeing the right node's slot.
    fn merge_children(&mut self, parent_id: NodeId, left_pos: usize) {
        let left_id = self.arena[parent_id.index()].children[left_pos];
        let right_id = self.arena[parent_id.index()].children[left_pos + 1];
        let sep = self.arena[parent_id.index()].keys[left_pos].clone();

        let mut right = std::mem::replace(&mut self.arena[right_id.index()], HashedNode::new_leaf());
        {
            let left = &mut self.arena[left_id.index()];
            if left.is_leaf {
                left.keys.append(&mut right.keys);
                left.values.append(&mut right.values);
                left.next_leaf = right.next_leaf;
                self.leaf_count -= 1;
            } else {
                left.keys.push(sep);
                left.keys.append(&mut right.keys);
                left.children.append(&mut right.children);
            }
        }
        self.free.push(right_id);

        let parent = &mut self.arena[parent_id.index()];
        parent.keys.remove(left_pos);
        parent.children.remove(left_pos + 1);

        self.rehash(left_id);
    }

    fn two_mut(&mut self, a: NodeId, b: NodeId) -> (&mut HashedNode, &mut HashedNode) {
        let (ai, bi) = (a.index(), b.index());
        debug_assert_ne!(ai, bi);
        if ai < bi {
            let (left, right) = self.arena.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = self.arena.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }

    /// Rebuild the leaf chain from tree order (used after decode, where the
    /// chain is not part of the persisted layout).
    fn relink_leaves(&mut self) {
        let mut leaves = Vec::new();
        let mut visited = vec![false; self.arena.len()];
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if id.index() >= self.arena.len() || visited[id.index()] {
                continue;
            }
            visited[id.index()] = true;
            let node = &self.arena[id.index()];
            if node.is_leaf {
                leaves.push(id);
            } else {
                for child in node.children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        for pair in leaves.windows(2) {
            self.arena[pair[0].index()].next_leaf = Some(pair[1]);
        }
        if let Some(&last) = leaves.last() {
            self.arena[last.index()].next_leaf = None;
        }
        self.leaf_count = leaves.len();
    }

    /// Flip the stored bytes of a leaf value in place, bypassing all hash
    /// maintenance. Simulates external corruption of the backing storage.
    #[cfg(test)]
    pub(crate) fn tamper_value(&mut self, key: &[u8], byte: usize) -> bool {
        let leaf_id = self.find_leaf(key);
        let node = &mut self.arena[leaf_id.index()];
        if let Ok(i) = node.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            if let Some(b) = node.values[i].get_mut(byte) {
                *b ^= 0xFF;
                return true;
            }
        }
        false
    }
}
