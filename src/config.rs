//! Configuration types.

use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum number of tasks executed concurrently.
    pub max_concurrent: usize,
    /// Minimum idle backoff of the dispatch loop.
    pub poll_backoff_min: Duration,
    /// Maximum idle backoff of the dispatch loop.
    pub poll_backoff_max: Duration,
    /// Running tasks without a heartbeat for this long are re-queued.
    pub stale_after: Duration,
    /// Recovery sweep interval.
    pub sweep_interval: Duration,
    /// How long `shutdown` waits for running executors to drain.
    pub drain_timeout: Duration,
    /// Capacity of the per-task live event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            poll_backoff_min: Duration::from_millis(25),
            poll_backoff_max: Duration::from_millis(500),
            stale_after: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            event_channel_capacity: 256,
        }
    }
}
