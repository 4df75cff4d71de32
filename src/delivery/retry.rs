//! Exponential backoff for transient delivery failures.

use std::time::Duration;
use rand::Rng;

/// Retry schedule for a destination.
///
/// The delay before retrying after failed attempt `k` (0-indexed) is
/// `base_delay * 2^k`, capped at `max_delay`, plus a random extra of up to
/// `jitter` times that value. Jitter only ever lengthens the delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `0.0..=1.0`.
    pub jitter: f64,
    /// Number of transient failures after which an event is dropped.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay for failed attempt `attempt` without jitter. This is the lower bound
    /// of [`delay_for_attempt`](Self::delay_for_attempt).
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        // NaN and infinities count as no jitter
        let jitter = if self.jitter.is_finite() { self.jitter.clamp(0.0, 1.0) } else { 0.0 };
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let extra = rand::rng().random_range(0.0..=jitter);
        base + base.mul_f64(extra)
    }

    /// Whether an event that has failed `attempts` times must be dropped.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }
}
