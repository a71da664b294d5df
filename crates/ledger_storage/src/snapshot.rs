//! Named, immutable snapshots.
//!
//! A snapshot is a pointer to a historical (timestamp, root hash) pair for
//! one table. Creating one captures the pair; nothing is copied. Snapshots
//! are immutable, resolved by name for time-travel queries, and removed only
//! by an explicit drop — never garbage-collected.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ledger_common::error::{LedgerError, LedgerResult};
use ledger_common::types::{Hash256, Timestamp};

/// A named immutable (timestamp, root hash) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub table: String,
    pub timestamp: Timestamp,
    pub merkle_root: Hash256,
}

/// Registry of named snapshots.
#[derive(Debug, Default)]
pub struct SnapshotManager {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot. A duplicate name is rejected: snapshots are
    /// immutable, so overwriting would silently retarget existing readers.
    pub fn create(&self, snapshot: Snapshot) -> LedgerResult<()> {
        let mut snapshots = self.snapshots.write();
        if snapshots.contains_key(&snapshot.name) {
            return Err(LedgerError::SnapshotExists(snapshot.name));
        }
        snapshots.insert(snapshot.name.clone(), snapshot);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> LedgerResult<Snapshot> {
        self.snapshots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::SnapshotNotFound(name.to_string()))
    }

    /// Explicit removal only.
    pub fn drop_snapshot(&self, name: &str) -> LedgerResult<Snapshot> {
        self.snapshots
            .write()
            .remove(name)
            .ok_or_else(|| LedgerError::SnapshotNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<Snapshot> {
        let mut all: Vec<Snapshot> = self.snapshots.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(name: &str, ts: u64) -> Snapshot {
        Snapshot {
            name: name.to_string(),
            table: "orders".to_string(),
            timestamp: Timestamp(ts),
            merkle_root: Hash256([0xCD; 32]),
        }
    }

    #[test]
    fn test_create_resolve_drop() {
        let mgr = SnapshotManager::new();
        mgr.create(snap("s1", 500)).unwrap();
        assert_eq!(mgr.len(), 1);

        let resolved = mgr.resolve("s1").unwrap();
        assert_eq!(resolved.timestamp, Timestamp(500));
        assert_eq!(resolved.table, "orders");

        let dropped = mgr.drop_snapshot("s1").unwrap();
        assert_eq!(dropped.name, "s1");
        assert!(mgr.is_empty());
        assert!(matches!(
            mgr.resolve("s1"),
            Err(LedgerError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mgr = SnapshotManager::new();
        mgr.create(snap("s1", 500)).unwrap();
        let err = mgr.create(snap("s1", 900)).unwrap_err();
        assert!(matches!(err, LedgerError::SnapshotExists(_)));
        // Original untouched.
        assert_eq!(mgr.resolve("s1").unwrap().timestamp, Timestamp(500));
    }

    #[test]
    fn test_drop_missing_is_an_error() {
        let mgr = SnapshotManager::new();
        assert!(matches!(
            mgr.drop_snapshot("ghost"),
            Err(LedgerError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_list_is_name_ordered() {
        let mgr = SnapshotManager::new();
        mgr.create(snap("weekly", 3)).unwrap();
        mgr.create(snap("daily", 2)).unwrap();
        mgr.create(snap("adhoc", 1)).unwrap();
        let names: Vec<String> = mgr.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["adhoc", "daily", "weekly"]);
    }
}
