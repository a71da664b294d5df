use thiserror::Error;

/// Convenience alias for `Result<T, LedgerError>`.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Top-level error type for the storage engine.
///
/// A missing key on a point read is NOT an error — read paths return
/// `Option` and callers branch on it. Proof verification failure is a plain
/// `false` from the verifier; policy on invalid proofs belongs to the caller.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A recomputed hash did not match stored state. Fatal for the affected
    /// table: further writes are refused until the index is rebuilt from the
    /// commit log.
    #[error("integrity violation on table '{table}': {detail}")]
    IntegrityViolation { table: String, detail: String },

    /// Write attempted against a table poisoned by an earlier integrity
    /// violation.
    #[error("table '{0}' refuses writes until rebuilt from its commit log")]
    TablePoisoned(String),

    /// Reorganization failed. The pre-compaction tree is still live and the
    /// table remains fully readable and writable.
    #[error("compaction failed: {0}")]
    CompactionFailure(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("snapshot '{0}' already exists")]
    SnapshotExists(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// An incremental change handler reported failure; the consumer's
    /// watermark was not advanced.
    #[error("change handler failed: {0}")]
    HandlerFailed(String),

    /// Broken internal invariant (e.g. a non-increasing oracle timestamp).
    /// Never expected in normal operation.
    #[error("internal invariant broken: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LedgerError::IntegrityViolation {
            table: "orders".into(),
            detail: "root hash mismatch".into(),
        };
        assert!(err.to_string().contains("orders"));
        assert!(err.to_string().contains("root hash mismatch"));

        let err = LedgerError::TablePoisoned("orders".into());
        assert!(err.to_string().contains("refuses writes"));
    }
}
