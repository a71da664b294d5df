//! Proof service — compact inclusion proofs for third-party audit.
//!
//! A proof carries the sibling hashes from one committed record up to the
//! table's root; a verifier holding only the root hash (e.g. from a snapshot
//! or a published audit anchor) can confirm the record's membership without
//! the rest of the history. Proofs are produced on demand and never
//! persisted.

use std::sync::Arc;

use ledger_common::error::LedgerResult;
use ledger_common::types::{Hash256, Timestamp};

use crate::engine::LedgerEngine;
use crate::mtree::merkle::{self, Proof};

/// A proof bundled with the leaf hash it starts from and the root it was
/// generated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitProof {
    pub table: String,
    pub timestamp: Timestamp,
    pub leaf_hash: Hash256,
    pub proof: Proof,
    pub root: Hash256,
}

impl CommitProof {
    /// Self-check against the root captured at generation time.
    pub fn verify(&self) -> bool {
        merkle::verify_proof(self.leaf_hash, &self.proof, self.root)
    }
}

/// Generates and verifies inclusion proofs against a live engine.
pub struct ProofService {
    engine: Arc<LedgerEngine>,
}

impl ProofService {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self { engine }
    }

    /// Proof for the commit at `timestamp`, against the table's current root.
    /// `Ok(None)` when no commit exists at that timestamp — a normal result,
    /// not an error.
    pub fn get_proof(
        &self,
        table: &str,
        timestamp: Timestamp,
    ) -> LedgerResult<Option<CommitProof>> {
        let Some((leaf_hash, proof)) = self.engine.proof_for(table, timestamp)? else {
            return Ok(None);
        };
        let root = self.engine.root_hash(table)?;
        Ok(Some(CommitProof {
            table: table.to_string(),
            timestamp,
            leaf_hash,
            proof,
            root,
        }))
    }

    /// Fold `proof` from `leaf_hash` and compare to `root_hash`. Pure; an
    /// invalid proof is a plain `false` and policy belongs to the caller.
    pub fn verify_proof(leaf_hash: Hash256, proof: &Proof, root_hash: Hash256) -> bool {
        merkle::verify_proof(leaf_hash, proof, root_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_common::config::EngineConfig;
    use ledger_common::types::Change;

    use crate::oracle::TimestampOracle;

    fn engine_with_commits(n: u32) -> (Arc<LedgerEngine>, Vec<Timestamp>) {
        let engine = Arc::new(LedgerEngine::with_oracle(
            EngineConfig::default(),
            Arc::new(TimestampOracle::with_start(0)),
        ));
        let timestamps = (0..n)
            .map(|i| {
                engine
                    .write_batch(
                        "orders",
                        vec![Change::insert(
                            format!("key{}", i).into_bytes(),
                            format!("val{}", i).into_bytes(),
                        )],
                    )
                    .unwrap()
                    .timestamp
            })
            .collect();
        (engine, timestamps)
    }

    #[test]
    fn test_proof_for_every_commit_verifies() {
        let (engine, timestamps) = engine_with_commits(17);
        let service = ProofService::new(Arc::clone(&engine));
        let root = engine.root_hash("orders").unwrap();

        for ts in &timestamps {
            let bundle = service.get_proof("orders", *ts).unwrap().unwrap();
            assert!(bundle.verify());
            assert_eq!(bundle.root, root);
            assert!(ProofService::verify_proof(
                bundle.leaf_hash,
                &bundle.proof,
                root
            ));
        }
    }

    #[test]
    fn test_missing_timestamp_yields_none() {
        let (engine, _) = engine_with_commits(3);
        let service = ProofService::new(engine);
        assert!(service
            .get_proof("orders", Timestamp(999_999))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let (engine, timestamps) = engine_with_commits(1);
        let service = ProofService::new(engine);
        assert!(service.get_proof("ghosts", timestamps[0]).is_err());
    }

    #[test]
    fn test_proof_rejects_foreign_root() {
        let (engine, timestamps) = engine_with_commits(5);
        let service = ProofService::new(Arc::clone(&engine));
        let bundle = service.get_proof("orders", timestamps[2]).unwrap().unwrap();

        // Advance the table: the old proof no longer reaches the new root.
        engine
            .write_batch(
                "orders",
                vec![Change::insert(b"late".to_vec(), b"entry".to_vec())],
            )
            .unwrap();
        let new_root = engine.root_hash("orders").unwrap();
        assert!(!ProofService::verify_proof(
            bundle.leaf_hash,
            &bundle.proof,
            new_root
        ));

        // A fresh proof against the new root verifies again.
        let fresh = service.get_proof("orders", timestamps[2]).unwrap().unwrap();
        assert_eq!(fresh.root, new_root);
        assert!(fresh.verify());
    }
}
