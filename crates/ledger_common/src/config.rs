use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// B+ tree fan-out bound M (max children per internal node). Min 4.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fan_out: default_fan_out(),
            compaction: CompactionConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

fn default_fan_out() -> usize {
    64
}

/// Universal compaction configuration.
///
/// The threshold is adaptive at runtime: reorganizations that arrive too
/// frequently raise it (less aggressive), too infrequently lower it, always
/// inside `[min_threshold, max_threshold]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Fragmentation ratio that triggers `reorganize()`.
    pub initial_threshold: f64,
    /// Lower bound for the adaptive threshold.
    pub min_threshold: f64,
    /// Upper bound for the adaptive threshold.
    pub max_threshold: f64,
    /// Adjustment applied per adaptation step.
    pub threshold_step: f64,
    /// Target number of index mutations between reorganizations.
    pub target_interval_ops: u64,
    /// Whether the write path checks the trigger automatically.
    pub auto: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            initial_threshold: 0.7,
            min_threshold: 0.5,
            max_threshold: 0.9,
            threshold_step: 0.05,
            target_interval_ops: 1024,
            auto: true,
        }
    }
}

/// Timestamp oracle configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Fixed starting timestamp. `None` seeds from the wall clock; tests set
    /// a fixed start for deterministic timestamps.
    #[serde(default)]
    pub start: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.fan_out, 64);
        assert_eq!(config.compaction.initial_threshold, 0.7);
        assert_eq!(config.compaction.min_threshold, 0.5);
        assert_eq!(config.compaction.max_threshold, 0.9);
        assert!(config.compaction.auto);
        assert!(config.oracle.start.is_none());
    }

    #[test]
    fn test_threshold_bounds_ordered() {
        let c = CompactionConfig::default();
        assert!(c.min_threshold <= c.initial_threshold);
        assert!(c.initial_threshold <= c.max_threshold);
    }
}
