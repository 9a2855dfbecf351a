//! Retry delays for requeued reconciles and bus publishes.
//!
//! Delays double per attempt from `base`, stop growing at `max` and are
//! spread by up to `jitter` of their value in either direction so that
//! keys failing together do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// How long a failed key or publish waits before its next attempt.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Wait after the first failure.
    pub base: Duration,

    /// Ceiling on the un-jittered wait.
    pub max: Duration,

    /// Fraction of the wait added or removed at random; clamped to `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for deterministic schedules.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Wait before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let wait = self
            .base
            .checked_mul(1 << attempt.min(31))
            .map_or(self.max, |wait| wait.min(self.max));

        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || wait.is_zero() {
            return wait;
        }
        let factor = 1.0 + rand::rng().random_range(-spread..=spread);
        wait.mul_f64(factor.max(0.0))
    }
}
