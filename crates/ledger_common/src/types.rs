use std::fmt;

use serde::{Deserialize, Serialize};

/// Commit timestamp — the universal sort key for all commits.
///
/// Issued exclusively by the `TimestampOracle`; strictly increasing
/// process-wide, so it doubles as the commit identifier and there is no
/// separate sequence-number concept.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Encode as a big-endian byte key. Preserves numeric ordering under
    /// lexicographic byte comparison, so timestamps sort correctly as index keys.
    pub fn to_key_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decode from a big-endian byte key. Returns `None` for keys of the
    /// wrong width (a foreign key in a timeline index is corruption).
    pub fn from_key_bytes(bytes: &[u8]) -> Option<Timestamp> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Timestamp(u64::from_be_bytes(arr)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 256-bit content hash (SHA-256 output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero sentinel used as the root of an empty index.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Fixed-length (64 hex chars) rendering for audit tooling.
    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hex-encode a byte slice for diagnostic/observability output.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Type of change carried by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single key-level change within a commit.
///
/// `value` is `None` for deletes. Changes inside a commit are stored in
/// canonical order (key, then op) so the serialized form is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub op: ChangeOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Change {
    pub fn insert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Change {
        Change {
            op: ChangeOp::Insert,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn update(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Change {
        Change {
            op: ChangeOp::Update,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Change {
        Change {
            op: ChangeOp::Delete,
            key: key.into(),
            value: None,
        }
    }
}

/// Sort changes into canonical commit order: by key, then by op.
pub fn canonicalize_changes(changes: &mut [Change]) {
    changes.sort_by(|a, b| a.key.cmp(&b.key).then(a.op.cmp(&b.op)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_key_bytes_roundtrip() {
        for ts in [0u64, 1, 1_000_000, u64::MAX] {
            let ts = Timestamp(ts);
            assert_eq!(Timestamp::from_key_bytes(&ts.to_key_bytes()), Some(ts));
        }
    }

    #[test]
    fn test_timestamp_key_bytes_preserve_order() {
        let a = Timestamp(150).to_key_bytes();
        let b = Timestamp(200).to_key_bytes();
        let c = Timestamp(70_000).to_key_bytes();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_timestamp_key_bytes_wrong_width() {
        assert_eq!(Timestamp::from_key_bytes(b"short"), None);
    }

    #[test]
    fn test_hash_hex_is_fixed_length() {
        assert_eq!(Hash256::ZERO.to_hex().len(), 64);
        let h = Hash256([0xAB; 32]);
        assert_eq!(h.to_hex(), "ab".repeat(32));
        assert_eq!(format!("{}", h), h.to_hex());
    }

    #[test]
    fn test_change_op_display() {
        assert_eq!(ChangeOp::Insert.to_string(), "INSERT");
        assert_eq!(ChangeOp::Update.to_string(), "UPDATE");
        assert_eq!(ChangeOp::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_canonicalize_changes_sorts_by_key_then_op() {
        let mut changes = vec![
            Change::delete(b"b".to_vec()),
            Change::insert(b"b".to_vec(), b"v".to_vec()),
            Change::insert(b"a".to_vec(), b"v".to_vec()),
        ];
        canonicalize_changes(&mut changes);
        assert_eq!(changes[0].key, b"a");
        assert_eq!(changes[1].op, ChangeOp::Insert);
        assert_eq!(changes[2].op, ChangeOp::Delete);
    }
}
