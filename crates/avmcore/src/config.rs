//! Host configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the core host. Defaults match the behavior the rest of the
/// system was calibrated against; tests shrink the sleeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Messages fed to the machine per run.
    pub max_message_batch_size: usize,
    /// Messages fed per step while advancing an execution cursor.
    pub cursor_message_batch_size: usize,
    /// Sideload machines kept in memory, in blocks.
    pub sideload_cache_size: u64,
    /// Gas cost charged to loading a checkpoint from storage; an execution
    /// cursor keeps its machine when re-running it is cheaper than this.
    pub checkpoint_load_gas_cost: u64,
    /// Number of logs-cursor slots (at most 255).
    pub logs_cursor_count: usize,
    /// Value cache generations rotated at checkpoint boundaries.
    pub value_cache_generations: usize,
    /// Host loop sleep while waiting for work.
    pub idle_sleep: Duration,
    /// Execution-cursor retries before giving up with `Busy`.
    pub reorg_retry_attempts: usize,
    /// Pause between execution-cursor retries.
    pub reorg_retry_sleep: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_message_batch_size: 10,
            cursor_message_batch_size: 10,
            sideload_cache_size: 20,
            checkpoint_load_gas_cost: 100_000_000,
            logs_cursor_count: 1,
            value_cache_generations: 5,
            idle_sleep: Duration::from_millis(5),
            reorg_retry_attempts: 16,
            reorg_retry_sleep: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_calibration() {
        let config = CoreConfig::default();
        assert_eq!(config.max_message_batch_size, 10);
        assert_eq!(config.sideload_cache_size, 20);
        assert_eq!(config.checkpoint_load_gas_cost, 100_000_000);
        assert_eq!(config.reorg_retry_attempts, 16);
        assert_eq!(config.reorg_retry_sleep, Duration::from_millis(250));
    }

    #[test]
    fn serde_round_trip_with_partial_input() {
        let parsed: CoreConfig =
            serde_json::from_str(r#"{ "max_message_batch_size": 3, "logs_cursor_count": 2 }"#)
                .unwrap();
        assert_eq!(parsed.max_message_batch_size, 3);
        assert_eq!(parsed.logs_cursor_count, 2);
        assert_eq!(parsed.sideload_cache_size, 20);

        let json = serde_json::to_string(&parsed).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_message_batch_size, 3);
    }
}
