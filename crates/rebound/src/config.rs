// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF, DEFAULT_BASE_DELAY, DEFAULT_IDEMPOTENCY_LEASE, DEFAULT_IDEMPOTENCY_TTL, DEFAULT_JITTER, DEFAULT_JITTER_RATIO,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER,
};
use crate::{Backoff, BackoffSpec, Jitter, MaxAttempts};

/// Retry settings in a form that can be loaded from configuration files.
///
/// Durations are whole milliseconds. Missing fields take their defaults, so a
/// partial document is valid:
///
/// ```json
/// { "max_attempts": 6, "base_delay_ms": 10, "max_delay_ms": 200, "jitter": "none" }
/// ```
///
/// Apply it with [`RetryBuilder::config`][crate::RetryBuilder::config] and
/// [`Batch::config`][crate::Batch::config]. Out-of-range values are sanitized when
/// applied; call [`validate`][Self::validate] to reject them instead.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(any(feature = "serde", test), serde(default))]
#[non_exhaustive]
pub struct RetryConfig {
    /// Attempt cap including the first attempt. `None` removes the cap.
    pub max_attempts: Option<u32>,

    /// Wall-clock ceiling for one invocation.
    pub max_elapsed_ms: Option<u64>,

    /// Growth of the delay between attempts.
    pub backoff: Backoff,

    /// Randomization applied to each delay.
    pub jitter: Jitter,

    /// Delay before the first retry.
    pub base_delay_ms: u64,

    /// Upper bound for a single delay. `None` leaves delays unbounded.
    pub max_delay_ms: Option<u64>,

    /// Growth factor for exponential backoff.
    pub multiplier: f64,

    /// Strength of the jitter, in `[0, 1]`.
    pub jitter_ratio: f64,

    /// How long finished idempotency records are kept.
    pub idempotency_ttl_ms: u64,

    /// How long a claim on an idempotency key stays valid.
    pub idempotency_lease_ms: u64,

    /// Batch concurrency. `None` uses the available parallelism.
    pub parallelism: Option<usize>,

    /// Whether a batch stops at its first failed item.
    pub abort_on_first_failure: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            max_elapsed_ms: None,
            backoff: DEFAULT_BACKOFF,
            jitter: DEFAULT_JITTER,
            base_delay_ms: millis(DEFAULT_BASE_DELAY),
            max_delay_ms: Some(millis(DEFAULT_MAX_DELAY)),
            multiplier: DEFAULT_MULTIPLIER,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            idempotency_ttl_ms: millis(DEFAULT_IDEMPOTENCY_TTL),
            idempotency_lease_ms: millis(DEFAULT_IDEMPOTENCY_LEASE),
            parallelism: None,
            abort_on_first_failure: false,
        }
    }
}

impl RetryConfig {
    /// Checks that every value is within its documented range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigError::ZeroMaxAttempts);
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }

        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::InvalidJitterRatio(self.jitter_ratio));
        }

        if let Some(max_delay_ms) = self.max_delay_ms
            && max_delay_ms < self.base_delay_ms
        {
            return Err(ConfigError::MaxDelayBelowBase {
                base_delay_ms: self.base_delay_ms,
                max_delay_ms,
            });
        }

        if self.parallelism == Some(0) {
            return Err(ConfigError::ZeroParallelism);
        }

        if self.idempotency_lease_ms == 0 {
            return Err(ConfigError::ZeroLease);
        }

        Ok(())
    }

    pub(crate) fn max_attempts(&self) -> MaxAttempts {
        self.max_attempts.map_or(MaxAttempts::Infinite, MaxAttempts::Finite)
    }

    pub(crate) fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed_ms.map(Duration::from_millis)
    }

    pub(crate) fn backoff_spec(&self) -> BackoffSpec {
        let spec = BackoffSpec::new(self.backoff)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .multiplier(self.multiplier)
            .jitter(self.jitter)
            .jitter_ratio(self.jitter_ratio);

        match self.max_delay_ms {
            Some(max) => spec.max_delay(Duration::from_millis(max)),
            None => spec.unbounded(),
        }
    }

    pub(crate) fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency_ttl_ms)
    }

    pub(crate) fn idempotency_lease(&self) -> Duration {
        Duration::from_millis(self.idempotency_lease_ms)
    }
}

/// A [`RetryConfig`] value is out of range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// `max_attempts` is zero, which would never run the operation.
    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,

    /// `multiplier` is below 1 or not finite.
    #[error("multiplier must be a finite number >= 1, got {0}")]
    InvalidMultiplier(f64),

    /// `jitter_ratio` is outside `[0, 1]`.
    #[error("jitter_ratio must be within [0, 1], got {0}")]
    InvalidJitterRatio(f64),

    /// `max_delay_ms` is smaller than `base_delay_ms`.
    #[error("max_delay_ms ({max_delay_ms}) is below base_delay_ms ({base_delay_ms})")]
    MaxDelayBelowBase {
        /// Configured base delay.
        base_delay_ms: u64,
        /// Configured maximum delay.
        max_delay_ms: u64,
    },

    /// `parallelism` is zero.
    #[error("parallelism must be at least 1")]
    ZeroParallelism,

    /// `idempotency_lease_ms` is zero.
    #[error("idempotency_lease_ms must be positive")]
    ZeroLease,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
