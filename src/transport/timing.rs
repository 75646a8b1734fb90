//! Reconnection backoff.
//!
//! Delay for attempt `n` is `base * 2^n`, capped at `max`, then perturbed by
//! a uniform offset in `[-delay * jitter, +delay * jitter]` so that peers
//! which dropped together do not redial in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::core::ReconnectConfig;

/// Exponential backoff with a cap and symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_factor: f64,
}

impl Backoff {
    /// Create a backoff schedule. `jitter_factor` is clamped to `[0, 1]`.
    pub fn new(base: Duration, max: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Build the schedule described by a reconnect policy.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.jitter_factor)
    }

    /// Delay before jitter: `min(base * 2^attempt, max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay drawing from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter_factor == 0.0 {
            return delay;
        }

        let spread = delay.as_secs_f64() * self.jitter_factor;
        let offset = rng.gen_range(-spread..=spread);
        Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.0)).unwrap_or(self.max)
    }
}
