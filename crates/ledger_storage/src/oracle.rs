//! Commit timestamp oracle.
//!
//! Produces a process-wide, strictly increasing 64-bit timestamp on every
//! call, safe under concurrent callers. The timestamp is the sort key for all
//! commits across all tables, so there is no separate sequence-number concept.
//!
//! The oracle is an ordinary owned object passed into the engine, not a
//! process global: tests construct one with a fixed logical start and get
//! fully deterministic timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ledger_common::config::OracleConfig;
use ledger_common::types::Timestamp;

/// Strictly-increasing timestamp source.
///
/// Wall-clock mode (`new`) seeds from the current time in microseconds and
/// tracks it, so timestamps stay close to real time while never repeating or
/// regressing. Logical mode (`with_start`) ignores the clock entirely and
/// issues a dense sequence — deterministic for tests.
#[derive(Debug)]
pub struct TimestampOracle {
    last: AtomicU64,
    use_wall_clock: bool,
}

impl TimestampOracle {
    /// Wall-clock seeded oracle.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(wall_clock_micros()),
            use_wall_clock: true,
        }
    }

    /// Purely logical oracle starting at `start`; the first issued timestamp
    /// is `start + 1`.
    pub fn with_start(start: u64) -> Self {
        Self {
            last: AtomicU64::new(start),
            use_wall_clock: false,
        }
    }

    pub fn from_config(config: &OracleConfig) -> Self {
        match config.start {
            Some(start) => Self::with_start(start),
            None => Self::new(),
        }
    }

    /// Issue the next commit timestamp.
    ///
    /// Guaranteed strictly greater than every previously issued timestamp,
    /// even across threads: an atomic compare-exchange loop with spin-wait
    /// backoff serializes the advance. A non-increasing issue would be an
    /// unrecoverable internal bug, asserted rather than returned.
    pub fn commit_timestamp(&self) -> Timestamp {
        loop {
            let last = self.last.load(Ordering::Acquire);
            let mut candidate = last + 1;
            if self.use_wall_clock {
                candidate = candidate.max(wall_clock_micros());
            }
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug_assert!(candidate > last, "timestamp oracle issued a duplicate");
                    return Timestamp(candidate);
                }
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// The most recently issued timestamp (the start value if none issued).
    pub fn last_timestamp(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::Acquire))
    }
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
