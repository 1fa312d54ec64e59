//! Queue configuration.
//!
//! Plain struct with sensible defaults; embed it in whatever configuration
//! surface the host application uses.

use std::time::Duration;

/// Configuration for a [`crate::SaveQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Fixed delay between periodic flush cycles.
    pub save_interval: Duration,

    /// Grace window slept after a buffer swap before draining begins.
    pub switch_delay: Duration,

    /// Accepted for compatibility; the queue always runs exactly one
    /// background flush worker regardless of this value.
    pub thread_count: usize,

    /// How long `stop()` waits for the worker to finish its final flush
    /// before detaching it.
    pub stop_timeout: Duration,

    /// Individual retry failures allowed per item before it is moved to
    /// quarantine. `None` retries failing items every cycle forever.
    pub max_item_retries: Option<u32>,
}

impl QueueConfig {
    /// Create a config with explicit flush period and grace window, keeping
    /// the remaining defaults.
    pub fn with_intervals(save_interval_ms: u64, switch_delay_ms: u64) -> Self {
        Self {
            save_interval: Duration::from_millis(save_interval_ms),
            switch_delay: Duration::from_millis(switch_delay_ms),
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_millis(1000),
            switch_delay: Duration::from_millis(50),
            thread_count: 1,
            stop_timeout: Duration::from_secs(30),
            max_item_retries: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.save_interval, Duration::from_millis(1000));
        assert_eq!(config.switch_delay, Duration::from_millis(50));
        assert_eq!(config.thread_count, 1);
        assert!(config.max_item_retries.is_none());
    }

    #[test]
    fn test_with_intervals() {
        let config = QueueConfig::with_intervals(200, 10);
        assert_eq!(config.save_interval, Duration::from_millis(200));
        assert_eq!(config.switch_delay, Duration::from_millis(10));
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
    }
}
