//! Reconnect backoff
//!
//! Exponential delay with symmetric jitter: attempt `n` waits
//! `min(base * multiplier^n, max) * (1 ± jitter_ratio)`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_secs_f64", rename = "base_delay_seconds")]
    pub base_delay: Duration,
    /// Upper bound before jitter
    #[serde(with = "duration_secs_f64", rename = "max_delay_seconds")]
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffConfig {
    /// No delay at all; handy in tests.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter_ratio: 0.0,
        }
    }
}

/// Exponential backoff calculator.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay for `attempt` after the cap, before jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped.is_finite() {
            Duration::ZERO
        } else {
            self.config.max_delay
        }
    }

    /// Jittered delay for the 0-indexed `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || capped.is_zero() {
            return capped;
        }
        let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
        Duration::from_secs_f64((capped.as_secs_f64() * factor).max(0.0))
    }
}

mod duration_secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
