//! Retry policy for the Orchestrator's optimistic-concurrency retry loop.
//!
//! Exponential backoff with a cap and jitter, ported in spirit from the
//! teacher's `RetryConfig` (`src/utils/retry.rs`).

use std::time::Duration;

use rand::Rng;

/// Configuration for the concurrency-conflict retry loop (spec §4.D
/// Step 6, "Bound the retry count ... default 3").
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap, before jitter.
    pub max_delay: Duration,
    /// Maximum number of retry attempts after the initial try.
    pub max_retries: u32,
    /// Jitter factor: delay multiplied by a random value in
    /// `[1 - jitter, 1 + jitter]`. `0.0` disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            max_retries: 3,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay for a given 0-indexed attempt: exponential backoff capped
    /// at `max_delay`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);

        let jittered_ms = if self.jitter > 0.0 {
            let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
            ((capped_ms as f64) * factor).max(0.0) as u64
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms)
    }

    /// Whether another retry attempt should be made for the given
    /// 0-indexed attempt number.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
