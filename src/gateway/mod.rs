//! Provider gateway for OpenAI-compatible chat completions.

pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::time::Duration;

use rand::Rng;

pub use error::{ErrorContext, ProviderError};
pub use openai::{ChatProvider, OpenAiCompatAdapter};
pub use types::*;
pub use usage::{AttemptOutcome, AttemptRecord, NoopUsageSink, UsageSink};

/// Bounded retry with exponential backoff.
///
/// `max_attempts` counts every attempt, the first one included.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts. Used by tests and stubs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0 for the wait after the first failure).
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        backoff_delay(self.base_delay, self.max_delay, retry, rng.gen_range(0.1..=0.3))
    }
}

/// `base * 2^retry` plus `jitter` of itself, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, retry: u32, jitter: f64) -> Duration {
    let multiplier = 2u32.saturating_pow(retry.min(16));
    let delay = base.saturating_mul(multiplier);
    let delay = delay.saturating_add(delay.mul_f64(jitter.clamp(0.0, 1.0)));
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        assert_eq!(backoff_delay(base, max, 0, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 2, 0.0), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, max, 2, 0.5), Duration::from_millis(600));
        assert_eq!(backoff_delay(base, max, 10, 0.3), max);
        assert_eq!(backoff_delay(base, max, u32::MAX, 0.3), max);
    }

    #[test]
    fn jitter_stays_within_ten_to_thirty_percent() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(60),
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = policy.delay_for(1, &mut rng);
            assert!(d >= Duration::from_millis(2_199), "{d:?}");
            assert!(d <= Duration::from_millis(2_601), "{d:?}");
        }
    }
}
