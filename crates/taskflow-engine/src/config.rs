//! Loop configuration

use std::time::Duration;

use crate::backoff::Backoff;

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between ticks.
    pub tick_interval: Duration,
    /// Retry policy for transient store errors within a tick.
    pub store_retry: Backoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            store_retry: Backoff::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_store_retry(mut self, store_retry: Backoff) -> Self {
        self.store_retry = store_retry;
        self
    }
}

/// Configuration for the pusher loop.
#[derive(Debug, Clone)]
pub struct PusherConfig {
    /// Pause between ticks.
    pub tick_interval: Duration,
    /// Maximum queued rows claimed per dispatch pass.
    pub dispatch_batch_size: i64,
    /// Deadline for one worker dispatch or sync call; exceeding it abandons
    /// that destination's batch, not the loop.
    pub batch_deadline: Duration,
    /// Delay before a failed dispatch is retried.
    pub retry_delay: Duration,
    /// Retry policy for transient store errors within a tick.
    pub store_retry: Backoff,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            dispatch_batch_size: 100,
            batch_deadline: Duration::from_secs(30),
            retry_delay: Duration::from_secs(60),
            store_retry: Backoff::default(),
        }
    }
}

impl PusherConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_dispatch_batch_size(mut self, size: i64) -> Self {
        self.dispatch_batch_size = size.max(1);
        self
    }

    pub fn with_batch_deadline(mut self, deadline: Duration) -> Self {
        self.batch_deadline = deadline;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_store_retry(mut self, store_retry: Backoff) -> Self {
        self.store_retry = store_retry;
        self
    }
}
