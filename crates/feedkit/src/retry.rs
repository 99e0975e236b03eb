//! Automatic retry with exponential backoff for remote boundary fetches.
//!
//! A remote hook registered with
//! [`on_each_load_before`](crate::remote::RemoteHooks::on_each_load_before) or
//! [`on_each_load_after`](crate::remote::RemoteHooks::on_each_load_after)
//! that fails is re-invoked with [`LoadState::Retry`](crate::remote::LoadState::Retry)
//! up to `max_retries` times. Past that the direction stays in
//! [`LoadStatus::Error`](crate::remote::LoadStatus::Error) until the engine
//! signals the boundary again.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of automatic retries (0 = wait for the next boundary signal).
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Whether to shave a deterministic fraction off each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay before retry `attempt` (0-indexed): `initial_delay * multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64())
            .max(0.0);
        let delay = Duration::from_secs_f64(secs);
        if !self.jitter {
            return delay;
        }
        // Cycles through 90%, 80% and 70% of the delay.
        let shave = f64::from(attempt % 3 + 1) * 0.1;
        delay.mul_f64(1.0 - shave)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
