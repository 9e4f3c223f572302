//! Retry policy and exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// Fraction of the computed delay used as the jitter band (±10%).
pub const JITTER_FRACTION: f64 = 0.1;

/// How connection attempts are retried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay (before jitter).
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Randomly perturb each delay by up to ±10%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts this policy allows.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay after the given (0-indexed) failed attempt:
    /// `min(base_delay * multiplier^attempt, max_delay)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    /// Delay to sleep before retrying after `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(-1.0..=1.0);
        apply_jitter(delay, factor)
    }
}

/// Perturb `delay` by `factor * 10%`, with `factor` in `[-1.0, 1.0]`.
fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(-1.0, 1.0);
    let secs = delay.as_secs_f64();
    Duration::try_from_secs_f64((secs + secs * JITTER_FRACTION * factor).max(0.0)).unwrap_or(delay)
}

/// Linear backoff: `step × (attempt + 1)`, saturating at `Duration::MAX`.
pub(crate) fn linear_backoff(step: Duration, attempt: u32) -> Duration {
    step.checked_mul(attempt.saturating_add(1)).unwrap_or(Duration::MAX)
}
