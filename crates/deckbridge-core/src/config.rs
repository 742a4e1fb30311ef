//! Reconciler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the batch scheduler's debounce window.
///
/// These are the only numeric knobs the engine exposes: a poke schedules
/// a drain `debounce_wait_ms` later, each further poke slides that
/// deadline, and a burst of continuous pokes is force-flushed
/// `debounce_max_wait_ms` after it began.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Quiet period after the last poke before a drain runs.
    pub debounce_wait_ms: u64,
    /// Upper bound on how long continuous pokes can delay a drain.
    pub debounce_max_wait_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce_wait_ms: 10,
            debounce_max_wait_ms: 50,
        }
    }
}

impl ReconcilerConfig {
    /// Sliding debounce window.
    #[must_use]
    pub const fn wait(&self) -> Duration {
        Duration::from_millis(self.debounce_wait_ms)
    }

    /// Forced-flush bound, never less than the sliding window.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.debounce_max_wait_ms.max(self.debounce_wait_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.wait(), Duration::from_millis(10));
        assert_eq!(config.max_wait(), Duration::from_millis(50));
    }

    #[test]
    fn max_wait_never_undercuts_wait() {
        let config = ReconcilerConfig {
            debounce_wait_ms: 40,
            debounce_max_wait_ms: 5,
        };
        assert_eq!(config.max_wait(), Duration::from_millis(40));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = ReconcilerConfig {
            debounce_wait_ms: 3,
            debounce_max_wait_ms: 12,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<ReconcilerConfig>(&json).unwrap(), config);
    }
}
