//! Per-table commit timeline.
//!
//! An append-only history of commits, each bound to the root hash of the
//! table's hashed index at commit time. The index is keyed by the big-endian
//! commit timestamp and stores the commit's canonical serialized record, so a
//! range query over timestamps is a range query over the index and every
//! commit is covered by the Merkle root.
//!
//! Golden path (write):
//! ```text
//! LedgerEngine.write_batch()
//!   → TimestampOracle.commit_timestamp()            [total order]
//!   → TableTimeline.commit()
//!     → canonical change sort (key, then op)
//!     → bincode(CommitRecord) → index.insert(ts → bytes)
//!     → compaction trigger check
//!     → root_hash() read back → Commit appended
//!     → materialized current state updated
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ledger_common::config::EngineConfig;
use ledger_common::error::{LedgerError, LedgerResult};
use ledger_common::types::{canonicalize_changes, Change, ChangeOp, Hash256, Timestamp};

use crate::mtree::compaction::{CompactionEngine, ReorgStats};
use crate::mtree::merkle::{self, hash_entry, Proof};
use crate::mtree::HashedOrderedIndex;
use crate::oracle::TimestampOracle;

/// An atomic, timestamped record of changes to one table, bound to the
/// index's root hash immediately after the commit. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Commit identifier — equal to `timestamp`.
    pub id: Timestamp,
    pub timestamp: Timestamp,
    pub table: String,
    /// Changes in canonical order (key, then op).
    pub changes: Vec<Change>,
    /// Root hash of the table's index immediately after this commit.
    pub merkle_root: Hash256,
    /// Previous commit on this table, if any.
    pub parent: Option<Timestamp>,
    pub metadata: BTreeMap<String, String>,
}

impl Commit {
    /// The canonical bytes stored in the index leaf for this commit.
    ///
    /// The record excludes `merkle_root`: the root is only known after the
    /// record has been inserted, and a self-referential hash would be
    /// unconstructible.
    pub fn record_bytes(&self) -> LedgerResult<Vec<u8>> {
        let record = CommitRecord {
            id: self.id,
            timestamp: self.timestamp,
            table: self.table.clone(),
            changes: self.changes.clone(),
            parent: self.parent,
            metadata: self.metadata.clone(),
        };
        bincode::serialize(&record).map_err(|e| LedgerError::Serialization(e.to_string()))
    }
}

/// The serialized form of a commit as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    id: Timestamp,
    timestamp: Timestamp,
    table: String,
    changes: Vec<Change>,
    parent: Option<Timestamp>,
    metadata: BTreeMap<String, String>,
}

/// Append-only, per-table history of commits bound to tree roots.
#[derive(Debug)]
pub struct TableTimeline {
    table: String,
    index: HashedOrderedIndex,
    compaction: CompactionEngine,
    auto_compact: bool,
    log: Vec<Commit>,
    state: BTreeMap<Vec<u8>, Vec<u8>>,
    latest: Timestamp,
    poisoned: bool,
}

impl TableTimeline {
    pub fn new(table: &str, config: &EngineConfig) -> Self {
        Self {
            table: table.to_string(),
            index: HashedOrderedIndex::new(config.fan_out),
            compaction: CompactionEngine::new(config.compaction.clone()),
            auto_compact: config.compaction.auto,
            log: Vec::new(),
            state: BTreeMap::new(),
            latest: Timestamp::ZERO,
            poisoned: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Timestamp of the newest commit (zero before the first commit).
    pub fn latest_timestamp(&self) -> Timestamp {
        self.latest
    }

    pub fn commit_count(&self) -> usize {
        self.log.len()
    }

    /// Current root hash of the table's index.
    pub fn root_hash(&self) -> Hash256 {
        self.index.root_hash()
    }

    /// Apply a change batch as one commit.
    pub fn commit(
        &mut self,
        oracle: &TimestampOracle,
        mut changes: Vec<Change>,
        metadata: BTreeMap<String, String>,
    ) -> LedgerResult<Commit> {
        if self.poisoned {
            return Err(LedgerError::TablePoisoned(self.table.clone()));
        }

        canonicalize_changes(&mut changes);
        let ts = oracle.commit_timestamp();
        debug_assert!(ts > self.latest, "oracle issued a non-increasing timestamp");

        let parent = self.log.last().map(|c| c.id);
        let record = CommitRecord {
            id: ts,
            timestamp: ts,
            table: self.table.clone(),
            changes: changes.clone(),
            parent,
            metadata: metadata.clone(),
        };
        let bytes =
            bincode::serialize(&record).map_err(|e| LedgerError::Serialization(e.to_string()))?;
        self.index.insert(&ts.to_key_bytes(), &bytes);

        if self.auto_compact && self.compaction.should_reorganize(&self.index) {
            // A failed reorganization keeps the old tree live; the commit
            // proceeds against it.
            if let Err(e) = self.compaction.reorganize(&mut self.index) {
                warn!(table = %self.table, error = %e, "auto-compaction failed");
            }
        }

        let merkle_root = self.index.root_hash();
        let commit = Commit {
            id: ts,
            timestamp: ts,
            table: self.table.clone(),
            changes,
            merkle_root,
            parent,
            metadata,
        };

        Self::apply_changes(&mut self.state, &commit.changes);
        self.log.push(commit.clone());
        self.latest = ts;

        debug!(
            table = %self.table,
            timestamp = %ts,
            changes = commit.changes.len(),
            root = %merkle_root,
            "commit appended"
        );
        Ok(commit)
    }

    /// Commits with timestamps in `(since, now]`, oldest first — a range
    /// query over the index.
    pub fn get_commits_since(&self, since: Timestamp) -> LedgerResult<Vec<Commit>> {
        let since_key = since.to_key_bytes();
        let rows = self
            .index
            .range(Bound::Excluded(since_key.as_slice()), Bound::Unbounded);

        let mut commits = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            let record: CommitRecord = bincode::deserialize(&bytes)
                .map_err(|e| LedgerError::Serialization(e.to_string()))?;
            let ts = Timestamp::from_key_bytes(&key).ok_or_else(|| {
                LedgerError::Serialization("malformed timestamp key in timeline index".into())
            })?;
            // The returned commit carries the root recorded at append time.
            let merkle_root = self
                .log
                .binary_search_by_key(&ts, |c| c.id)
                .ok()
                .map(|i| self.log[i].merkle_root)
                .unwrap_or(Hash256::ZERO);
            commits.push(Commit {
                id: record.id,
                timestamp: record.timestamp,
                table: record.table,
                changes: record.changes,
                merkle_root,
                parent: record.parent,
                metadata: record.metadata,
            });
        }
        Ok(commits)
    }

    /// Materialize the table state as of `ts` by replaying, in timestamp
    /// order, every commit with `timestamp ≤ ts`.
    pub fn query_as_of(&self, ts: Timestamp) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut state = BTreeMap::new();
        for commit in &self.log {
            if commit.timestamp > ts {
                break;
            }
            Self::apply_changes(&mut state, &commit.changes);
        }
        state
    }

    /// Point read from the materialized current state.
    pub fn read(&self, key: &[u8]) -> Option<&[u8]> {
        self.state.get(key).map(|v| v.as_slice())
    }

    /// Ordered scan of the materialized current state over `[start, end]`.
    pub fn range_read(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.state
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of live keys in the current state.
    pub fn state_len(&self) -> usize {
        self.state.len()
    }

    /// Structural and hash verification of the index alone.
    pub fn verify_integrity(&self) -> bool {
        self.index.verify_integrity()
    }

    /// Full timeline verification: the index verifies, and the root
    /// recomputed over the complete commit set matches the last recorded
    /// commit root. O(n) over the history by design.
    pub fn verify_timeline_integrity(&self) -> bool {
        if !self.index.verify_integrity() {
            return false;
        }
        let Some(last) = self.log.last() else {
            return self.index.is_empty() && self.index.root_hash().is_zero();
        };
        if self.index.len() != self.log.len() {
            return false;
        }
        let mut entry_hashes = Vec::with_capacity(self.log.len());
        for commit in &self.log {
            let bytes = match commit.record_bytes() {
                Ok(bytes) => bytes,
                Err(_) => return false,
            };
            entry_hashes.push(hash_entry(&commit.id.to_key_bytes(), &bytes));
        }
        let recomputed = merkle::root_over(entry_hashes);
        recomputed == last.merkle_root && self.index.root_hash() == last.merkle_root
    }

    /// Rebuild the index from the commit log — the authoritative replay
    /// source — and clear the poisoned flag. Returns the restored root.
    pub fn rebuild_from_log(&mut self, config: &EngineConfig) -> LedgerResult<Hash256> {
        let mut index = HashedOrderedIndex::new(config.fan_out);
        let mut state = BTreeMap::new();
        for commit in &self.log {
            let bytes = commit.record_bytes()?;
            index.insert(&commit.id.to_key_bytes(), &bytes);
            Self::apply_changes(&mut state, &commit.changes);
        }

        let root = index.root_hash();
        if let Some(last) = self.log.last() {
            if root != last.merkle_root {
                return Err(LedgerError::IntegrityViolation {
                    table: self.table.clone(),
                    detail: format!(
                        "replayed root {} does not match last committed root {}",
                        root, last.merkle_root
                    ),
                });
            }
        }

        self.index = index;
        self.state = state;
        self.poisoned = false;
        info!(table = %self.table, root = %root, "index rebuilt from commit log");
        Ok(root)
    }

    /// Run an explicit reorganization.
    pub fn compact(&mut self) -> LedgerResult<ReorgStats> {
        self.compaction.reorganize(&mut self.index)
    }

    pub fn compaction(&self) -> &CompactionEngine {
        &self.compaction
    }

    /// Inclusion proof for the commit at `ts`: the stored leaf's entry hash
    /// plus the sibling path to the current root.
    pub fn proof_for_timestamp(&self, ts: Timestamp) -> Option<(Hash256, Proof)> {
        self.index.proof_for_key(&ts.to_key_bytes())
    }

    /// Serialized commit log (ordered commit records) for the external
    /// packaging tool.
    pub fn export_commits(&self) -> LedgerResult<Vec<u8>> {
        bincode::serialize(&self.log).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    /// Serialized index (persisted node layout) for the external packaging
    /// tool.
    pub fn export_index(&self) -> LedgerResult<Vec<u8>> {
        self.index.encode()
    }

    fn apply_changes(state: &mut BTreeMap<Vec<u8>, Vec<u8>>, changes: &[Change]) {
        for change in changes {
            match change.op {
                ChangeOp::Insert | ChangeOp::Update => {
                    state.insert(
                        change.key.clone(),
                        change.value.clone().unwrap_or_default(),
                    );
                }
                ChangeOp::Delete => {
                    state.remove(&change.key);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn index_mut(&mut self) -> &mut HashedOrderedIndex {
        &mut self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline() -> (TableTimeline, TimestampOracle) {
        let config = EngineConfig::default();
        (
            TableTimeline::new("orders", &config),
            TimestampOracle::with_start(0),
        )
    }

    fn one_change(i: u32) -> Vec<Change> {
        vec![Change::insert(
            format!("key{}", i).into_bytes(),
            format!("val{}", i).into_bytes(),
        )]
    }

    #[test]
    fn test_commit_binds_root_and_links_parent() {
        let (mut tl, oracle) = timeline();
        let c1 = tl.commit(&oracle, one_change(1), BTreeMap::new()).unwrap();
        let c2 = tl.commit(&oracle, one_change(2), BTreeMap::new()).unwrap();

        assert_eq!(c1.id, c1.timestamp);
        assert_eq!(c1.parent, None);
        assert_eq!(c2.parent, Some(c1.id));
        assert!(c2.timestamp > c1.timestamp);
        assert_eq!(c1.merkle_root, {
            // Root at commit 1 covered exactly commit 1.
            let bytes = c1.record_bytes().unwrap();
            merkle::root_over(vec![hash_entry(&c1.id.to_key_bytes(), &bytes)])
        });
        assert_eq!(tl.root_hash(), c2.merkle_root);
        assert_eq!(tl.latest_timestamp(), c2.timestamp);
        assert_eq!(tl.commit_count(), 2);
    }

    #[test]
    fn test_changes_are_canonically_ordered() {
        let (mut tl, oracle) = timeline();
        let commit = tl
            .commit(
                &oracle,
                vec![
                    Change::delete(b"zebra".to_vec()),
                    Change::insert(b"apple".to_vec(), b"1".to_vec()),
                    Change::update(b"apple".to_vec(), b"2".to_vec()),
                ],
                BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(commit.changes[0].key, b"apple");
        assert_eq!(commit.changes[0].op, ChangeOp::Insert);
        assert_eq!(commit.changes[1].op, ChangeOp::Update);
        assert_eq!(commit.changes[2].key, b"zebra");
    }

    #[test]
    fn test_get_commits_since_is_a_range_query() {
        let (mut tl, oracle) = timeline();
        let commits: Vec<Commit> = (0..5)
            .map(|i| tl.commit(&oracle, one_change(i), BTreeMap::new()).unwrap())
            .collect();

        let since = commits[1].timestamp;
        let tail = tl.get_commits_since(since).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].id, commits[2].id);
        assert_eq!(tail[2].id, commits[4].id);
        // Roots round-trip from the log, not the serialized record.
        assert_eq!(tail[0].merkle_root, commits[2].merkle_root);

        assert!(tl
            .get_commits_since(commits[4].timestamp)
            .unwrap()
            .is_empty());
        assert_eq!(tl.get_commits_since(Timestamp::ZERO).unwrap().len(), 5);
    }

    #[test]
    fn test_query_as_of_replays_prefix() {
        let (mut tl, oracle) = timeline();
        let c1 = tl
            .commit(
                &oracle,
                vec![Change::insert(b"a".to_vec(), b"1".to_vec())],
                BTreeMap::new(),
            )
            .unwrap();
        let c2 = tl
            .commit(
                &oracle,
                vec![
                    Change::update(b"a".to_vec(), b"2".to_vec()),
                    Change::insert(b"b".to_vec(), b"3".to_vec()),
                ],
                BTreeMap::new(),
            )
            .unwrap();
        let c3 = tl
            .commit(
                &oracle,
                vec![Change::delete(b"a".to_vec())],
                BTreeMap::new(),
            )
            .unwrap();

        let at1 = tl.query_as_of(c1.timestamp);
        assert_eq!(at1.get(b"a".as_slice()), Some(&b"1".to_vec()));
        assert_eq!(at1.len(), 1);

        let at2 = tl.query_as_of(c2.timestamp);
        assert_eq!(at2.get(b"a".as_slice()), Some(&b"2".to_vec()));
        assert_eq!(at2.get(b"b".as_slice()), Some(&b"3".to_vec()));

        let at3 = tl.query_as_of(c3.timestamp);
        assert!(at3.get(b"a".as_slice()).is_none());
        assert_eq!(at3.len(), 1);

        // Current state equals the replay at the newest timestamp.
        assert_eq!(tl.read(b"b"), Some(b"3".as_slice()));
        assert!(tl.read(b"a").is_none());
        assert_eq!(tl.state_len(), 1);
    }

    #[test]
    fn test_replay_consistency_at_every_commit() {
        let (mut tl, oracle) = timeline();
        let mut commits = Vec::new();
        for i in 0..20 {
            let mut changes = one_change(i);
            if i % 3 == 0 && i > 0 {
                changes.push(Change::delete(format!("key{}", i - 1).into_bytes()));
            }
            commits.push(tl.commit(&oracle, changes, BTreeMap::new()).unwrap());
        }

        let mut replayed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for commit in &commits {
            for change in &commit.changes {
                match change.op {
                    ChangeOp::Insert | ChangeOp::Update => {
                        replayed.insert(
                            change.key.clone(),
                            change.value.clone().unwrap_or_default(),
                        );
                    }
                    ChangeOp::Delete => {
                        replayed.remove(&change.key);
                    }
                }
            }
            assert_eq!(tl.query_as_of(commit.timestamp), replayed);
        }
    }

    #[test]
    fn test_verify_timeline_integrity() {
        let (mut tl, oracle) = timeline();
        assert!(tl.verify_timeline_integrity());
        for i in 0..10 {
            tl.commit(&oracle, one_change(i), BTreeMap::new()).unwrap();
        }
        assert!(tl.verify_timeline_integrity());
    }

    #[test]
    fn test_tamper_poison_rebuild_cycle() {
        let (mut tl, oracle) = timeline();
        let mut last_root = Hash256::ZERO;
        for i in 0..8 {
            last_root = tl
                .commit(&oracle, one_change(i), BTreeMap::new())
                .unwrap()
                .merkle_root;
        }

        // Corrupt a stored commit record.
        let ts = tl.log[3].id;
        assert!(tl.index_mut().tamper_value(&ts.to_key_bytes(), 4));
        assert!(!tl.verify_integrity());
        assert!(!tl.verify_timeline_integrity());

        tl.poison();
        let err = tl.commit(&oracle, one_change(99), BTreeMap::new()).unwrap_err();
        assert!(matches!(err, LedgerError::TablePoisoned(_)));

        // The commit log is authoritative; replay restores the exact root.
        let config = EngineConfig::default();
        let root = tl.rebuild_from_log(&config).unwrap();
        assert_eq!(root, last_root);
        assert!(tl.verify_timeline_integrity());
        assert!(!tl.is_poisoned());
        assert!(tl.commit(&oracle, one_change(100), BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_export_commits_roundtrip() {
        let (mut tl, oracle) = timeline();
        for i in 0..4 {
            tl.commit(&oracle, one_change(i), BTreeMap::new()).unwrap();
        }
        let bytes = tl.export_commits().unwrap();
        let decoded: Vec<Commit> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, tl.log);
    }

    #[test]
    fn test_export_index_decodes_to_same_root() {
        let (mut tl, oracle) = timeline();
        for i in 0..30 {
            tl.commit(&oracle, one_change(i), BTreeMap::new()).unwrap();
        }
        let bytes = tl.export_index().unwrap();
        let decoded = HashedOrderedIndex::decode(&bytes).unwrap();
        assert_eq!(decoded.root_hash(), tl.root_hash());
        assert_eq!(decoded.len(), tl.commit_count());
    }

    #[test]
    fn test_metadata_rides_along() {
        let (mut tl, oracle) = timeline();
        let mut metadata = BTreeMap::new();
        metadata.insert("author".to_string(), "ingest-worker-3".to_string());
        let commit = tl.commit(&oracle, one_change(1), metadata).unwrap();
        assert_eq!(
            commit.metadata.get("author").map(String::as_str),
            Some("ingest-worker-3")
        );
        // Metadata is part of the hashed record.
        let since = tl.get_commits_since(Timestamp::ZERO).unwrap();
        assert_eq!(since[0].metadata, commit.metadata);
    }

    #[test]
    fn test_empty_change_batch_is_a_valid_commit() {
        let (mut tl, oracle) = timeline();
        let commit = tl.commit(&oracle, Vec::new(), BTreeMap::new()).unwrap();
        assert!(commit.changes.is_empty());
        assert!(!commit.merkle_root.is_zero());
        assert_eq!(tl.state_len(), 0);
    }
}
