//! # Backoff policy for availability polling and batch retries.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`. The base is
//! derived purely from the attempt number, so delays never shrink over time.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use microservice_framework::BackoffPolicy;
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(5),
//!     factor: 2.0,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(100));
//! assert_eq!(backoff.next(1), Duration::from_millis(200));
//! assert_eq!(backoff.next(10), Duration::from_secs(5));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// 100ms doubling up to 5s.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given attempt number (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let clamped_exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(clamped_exp);

        if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped_secs)
        }
    }
}

/// Serializable form of [`BackoffPolicy`] using millisecond fields.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub first_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffPolicy::default().into()
    }
}

impl From<BackoffConfig> for BackoffPolicy {
    fn from(cfg: BackoffConfig) -> Self {
        Self {
            first: Duration::from_millis(cfg.first_ms),
            max: Duration::from_millis(cfg.max_ms),
            factor: cfg.factor,
        }
    }
}

impl From<BackoffPolicy> for BackoffConfig {
    fn from(policy: BackoffPolicy) -> Self {
        Self {
            first_ms: policy.first.as_millis() as u64,
            max_ms: policy.max.as_millis() as u64,
            factor: policy.factor,
        }
    }
}
