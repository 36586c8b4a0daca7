//! Backoff policy for transient store errors
//!
//! Transient failures (connection drops, deadlocks, serialization
//! conflicts) are retried inside the current tick with exponential backoff
//! and jitter; once the attempt cap is reached the error propagates and the
//! tick is abandoned until the next period.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use taskflow_storage::StoreError;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// 0.0-1.0; 0.1 means plus or minus 10%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = (self.initial_interval.as_secs_f64() * exp)
            .min(self.max_interval.as_secs_f64());
        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Retry `op` on transient store errors up to the policy's attempt cap.
pub async fn retry_transient<T, F, Fut>(policy: &Backoff, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient store error; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_cap() {
        let policy = Backoff::default().without_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        // capped at max_interval
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_until_cap() {
        let policy = Backoff::default()
            .with_max_attempts(3)
            .with_initial_interval(Duration::from_millis(1))
            .without_jitter();
        let calls = AtomicU32::new(0);

        let result: Result<(), StoreError> = retry_transient(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("connection reset".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let policy = Backoff::default().with_max_attempts(5);
        let calls = AtomicU32::new(0);

        let result: Result<(), StoreError> = retry_transient(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Database("syntax error".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
