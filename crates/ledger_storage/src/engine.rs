//! Engine facade.
//!
//! Owns the shared timestamp oracle, the table registry, and the snapshot
//! registry, and exposes the four outbound functions the query layer calls
//! (`read`, `range`, `as_of`, `since`) plus the inbound `write_batch`.
//!
//! Concurrency model: one `RwLock` per table. Reads (`read`, `range`, proof
//! generation) share the lock; writes and compaction take it exclusively, so
//! no reader ever observes a partially applied commit or a mid-rebuild tree.
//! The single oracle totals-orders commits across all tables. Nothing here
//! performs I/O or carries a timeout — all blocking is lock contention.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use ledger_common::config::EngineConfig;
use ledger_common::error::{LedgerError, LedgerResult};
use ledger_common::types::{Change, Hash256, Timestamp};

use crate::incremental::ChangeSet;
use crate::mtree::compaction::ReorgStats;
use crate::mtree::merkle::Proof;
use crate::oracle::TimestampOracle;
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::timeline::{Commit, TableTimeline};

/// Engine-wide counters (lock-free atomics).
#[derive(Debug, Default)]
pub struct EngineStats {
    commits: AtomicU64,
    changes_written: AtomicU64,
    compactions: AtomicU64,
    compaction_failures: AtomicU64,
    integrity_checks: AtomicU64,
    integrity_failures: AtomicU64,
    proofs_generated: AtomicU64,
    snapshots_created: AtomicU64,
}

/// Immutable snapshot of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub commits: u64,
    pub changes_written: u64,
    pub compactions: u64,
    pub compaction_failures: u64,
    pub integrity_checks: u64,
    pub integrity_failures: u64,
    pub proofs_generated: u64,
    pub snapshots_created: u64,
}

impl EngineStats {
    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            changes_written: self.changes_written.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            compaction_failures: self.compaction_failures.load(Ordering::Relaxed),
            integrity_checks: self.integrity_checks.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            proofs_generated: self.proofs_generated.load(Ordering::Relaxed),
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
        }
    }
}

/// The tamper-evident storage engine.
pub struct LedgerEngine {
    config: EngineConfig,
    oracle: Arc<TimestampOracle>,
    tables: DashMap<String, Arc<RwLock<TableTimeline>>>,
    snapshots: SnapshotManager,
    stats: EngineStats,
}

impl LedgerEngine {
    pub fn new(config: EngineConfig) -> Self {
        let oracle = Arc::new(TimestampOracle::from_config(&config.oracle));
        Self::with_oracle(config, oracle)
    }

    /// Construct around an externally owned oracle — shared across engines
    /// or fixed-start for deterministic tests.
    pub fn with_oracle(config: EngineConfig, oracle: Arc<TimestampOracle>) -> Self {
        Self {
            config,
            oracle,
            tables: DashMap::new(),
            snapshots: SnapshotManager::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn oracle(&self) -> &Arc<TimestampOracle> {
        &self.oracle
    }

    // ── inbound ──────────────────────────────────────────────────────────

    /// Apply a change batch to `table` as one commit, creating the table on
    /// first write.
    pub fn write_batch(&self, table: &str, changes: Vec<Change>) -> LedgerResult<Commit> {
        self.write_batch_with_metadata(table, changes, BTreeMap::new())
    }

    pub fn write_batch_with_metadata(
        &self,
        table: &str,
        changes: Vec<Change>,
        metadata: BTreeMap<String, String>,
    ) -> LedgerResult<Commit> {
        let timeline = self.table_or_create(table);
        let mut guard = timeline.write();
        let commit = guard.commit(&self.oracle, changes, metadata)?;
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.stats
            .changes_written
            .fetch_add(commit.changes.len() as u64, Ordering::Relaxed);
        Ok(commit)
    }

    // ── outbound ─────────────────────────────────────────────────────────

    /// Current value of `key`. `None` for a missing table or key — a normal
    /// result, not an error.
    pub fn read(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        let timeline = self.tables.get(table)?;
        let guard = timeline.read();
        guard.read(key).map(|v| v.to_vec())
    }

    /// Ordered scan of the current state over `[start, end]`. Empty for a
    /// missing table.
    pub fn range(&self, table: &str, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        match self.tables.get(table) {
            Some(timeline) => timeline.read().range_read(start, end),
            None => Vec::new(),
        }
    }

    /// Materialized state as of `ts` (replay of all commits ≤ `ts`).
    pub fn as_of(&self, table: &str, ts: Timestamp) -> LedgerResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let timeline = self.table(table)?;
        let guard = timeline.read();
        Ok(guard.query_as_of(ts))
    }

    /// Commits strictly after `watermark`, with the follow-up watermark.
    pub fn since(&self, table: &str, watermark: Timestamp) -> LedgerResult<ChangeSet> {
        let timeline = self.table(table)?;
        let guard = timeline.read();
        let commits = guard.get_commits_since(watermark)?;
        let new_watermark = commits.last().map(|c| c.id).unwrap_or(watermark);
        Ok(ChangeSet {
            table: table.to_string(),
            commits,
            new_watermark,
        })
    }

    // ── integrity, compaction, audit ─────────────────────────────────────

    /// Current root hash for `table`.
    pub fn root_hash(&self, table: &str) -> LedgerResult<Hash256> {
        Ok(self.table(table)?.read().root_hash())
    }

    /// Root hash as the fixed-length hex string exposed to audit tooling.
    pub fn root_hash_hex(&self, table: &str) -> LedgerResult<String> {
        Ok(self.root_hash(table)?.to_hex())
    }

    /// Verify the table's index. `false` poisons the table: further writes
    /// are refused until `rebuild` replays the commit log.
    pub fn verify(&self, table: &str) -> LedgerResult<bool> {
        let timeline = self.table(table)?;
        self.stats.integrity_checks.fetch_add(1, Ordering::Relaxed);
        let mut guard = timeline.write();
        let ok = guard.verify_integrity();
        if !ok {
            guard.poison();
            self.stats.integrity_failures.fetch_add(1, Ordering::Relaxed);
            warn!(table = %table, "integrity violation: table poisoned until rebuild");
        }
        Ok(ok)
    }

    /// Verify the full timeline (index plus recomputed root over the whole
    /// commit set). `false` poisons the table like `verify`.
    pub fn verify_timeline(&self, table: &str) -> LedgerResult<bool> {
        let timeline = self.table(table)?;
        self.stats.integrity_checks.fetch_add(1, Ordering::Relaxed);
        let mut guard = timeline.write();
        let ok = guard.verify_timeline_integrity();
        if !ok {
            guard.poison();
            self.stats.integrity_failures.fetch_add(1, Ordering::Relaxed);
            warn!(table = %table, "timeline integrity violation: table poisoned until rebuild");
        }
        Ok(ok)
    }

    /// Rebuild a (typically poisoned) table's index from its commit log.
    pub fn rebuild(&self, table: &str) -> LedgerResult<Hash256> {
        let timeline = self.table(table)?;
        let mut guard = timeline.write();
        guard.rebuild_from_log(&self.config)
    }

    /// Run an explicit reorganization on `table`.
    pub fn compact(&self, table: &str) -> LedgerResult<ReorgStats> {
        let timeline = self.table(table)?;
        let mut guard = timeline.write();
        match guard.compact() {
            Ok(stats) => {
                self.stats.compactions.fetch_add(1, Ordering::Relaxed);
                Ok(stats)
            }
            Err(e) => {
                self.stats
                    .compaction_failures
                    .fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Leaf hash and sibling path for the commit at `ts`, or `None` if no
    /// commit exists there.
    pub fn proof_for(
        &self,
        table: &str,
        ts: Timestamp,
    ) -> LedgerResult<Option<(Hash256, Proof)>> {
        let timeline = self.table(table)?;
        let guard = timeline.read();
        let proof = guard.proof_for_timestamp(ts);
        if proof.is_some() {
            self.stats.proofs_generated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(proof)
    }

    // ── snapshots ────────────────────────────────────────────────────────

    /// Capture the current (timestamp, root hash) pair of `table` under
    /// `name`. Immutable thereafter.
    pub fn create_snapshot(&self, name: &str, table: &str) -> LedgerResult<Snapshot> {
        let root = self.root_hash(table)?;
        let snapshot = Snapshot {
            name: name.to_string(),
            table: table.to_string(),
            timestamp: self.oracle.last_timestamp(),
            merkle_root: root,
        };
        self.snapshots.create(snapshot.clone())?;
        self.stats.snapshots_created.fetch_add(1, Ordering::Relaxed);
        info!(name = %name, table = %table, timestamp = %snapshot.timestamp, "snapshot created");
        Ok(snapshot)
    }

    pub fn resolve_snapshot(&self, name: &str) -> LedgerResult<Snapshot> {
        self.snapshots.resolve(name)
    }

    pub fn drop_snapshot(&self, name: &str) -> LedgerResult<Snapshot> {
        self.snapshots.drop_snapshot(name)
    }

    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.list()
    }

    /// Time-travel read at a snapshot's captured timestamp.
    pub fn as_of_snapshot(&self, name: &str) -> LedgerResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let snapshot = self.snapshots.resolve(name)?;
        self.as_of(&snapshot.table, snapshot.timestamp)
    }

    // ── export (consumed by the external packaging tool) ─────────────────

    /// Serialized ordered commit records for `table`.
    pub fn export_commits(&self, table: &str) -> LedgerResult<Vec<u8>> {
        self.table(table)?.read().export_commits()
    }

    /// Serialized index (persisted node layout) for `table`.
    pub fn export_index(&self, table: &str) -> LedgerResult<Vec<u8>> {
        self.table(table)?.read().export_index()
    }

    // ── registry ─────────────────────────────────────────────────────────

    pub fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn table(&self, name: &str) -> LedgerResult<Arc<RwLock<TableTimeline>>> {
        self.tables
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LedgerError::TableNotFound(name.to_string()))
    }

    fn table_or_create(&self, name: &str) -> Arc<RwLock<TableTimeline>> {
        if let Some(entry) = self.tables.get(name) {
            return Arc::clone(entry.value());
        }
        let entry = self.tables.entry(name.to_string()).or_insert_with(|| {
            info!(table = %name, "table created");
            Arc::new(RwLock::new(TableTimeline::new(name, &self.config)))
        });
        Arc::clone(entry.value())
    }
}
