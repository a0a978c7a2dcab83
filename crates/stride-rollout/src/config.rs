//! Controller tuning knobs. Loaded from the `[controller]` table of
//! `strided.toml`; every field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Successful analysis runs kept per rollout after garbage collection.
    pub successful_run_history_limit: usize,
    /// Failed, errored or inconclusive runs kept per rollout.
    pub unsuccessful_run_history_limit: usize,
    /// Delay before re-checking a weight that has not taken effect.
    pub weight_verify_interval_secs: u64,
    /// Delay between checks of a running analysis.
    pub analysis_poll_interval_secs: u64,
    /// Delay when the current step's analysis run has not appeared yet.
    pub analysis_pending_interval_secs: u64,
    /// Delay while waiting for available replicas to catch up with ready ones.
    pub min_ready_interval_secs: u64,
    /// Reconcile workers.
    pub workers: usize,
    /// Every rollout is re-queued this often even without events.
    pub resync_interval_secs: u64,
    /// First retry delay after a failed pass; doubles per consecutive failure.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            successful_run_history_limit: 5,
            unsuccessful_run_history_limit: 5,
            weight_verify_interval_secs: 10,
            analysis_poll_interval_secs: 10,
            analysis_pending_interval_secs: 5,
            min_ready_interval_secs: 10,
            workers: 2,
            resync_interval_secs: 300,
            retry_base_delay_ms: 5,
            retry_max_delay_secs: 300,
        }
    }
}

impl ControllerConfig {
    pub fn weight_verify_interval(&self) -> Duration {
        Duration::from_secs(self.weight_verify_interval_secs)
    }

    pub fn analysis_poll_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_poll_interval_secs)
    }

    pub fn analysis_pending_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_pending_interval_secs)
    }

    pub fn min_ready_interval(&self) -> Duration {
        Duration::from_secs(self.min_ready_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Retry delay after `failures` consecutive failed passes (1-based).
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let base = Duration::from_millis(self.retry_base_delay_ms);
        let max = Duration::from_secs(self.retry_max_delay_secs);
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"workers": 8, "successful_run_history_limit": 2}"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.successful_run_history_limit, 2);
        assert_eq!(config.unsuccessful_run_history_limit, 5);
        assert_eq!(config.analysis_poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = ControllerConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(5));
        assert_eq!(config.retry_delay(2), Duration::from_millis(10));
        assert_eq!(config.retry_delay(4), Duration::from_millis(40));
        assert_eq!(config.retry_delay(40), Duration::from_secs(300));
    }
}
