// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Delay schedules between attempts.

use std::time::Duration;

use crate::constants::{DEFAULT_BACKOFF, DEFAULT_BASE_DELAY, DEFAULT_JITTER, DEFAULT_JITTER_RATIO, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER};
use crate::rnd::Rnd;

/// How the delay grows from one retry to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(any(feature = "serde", test), serde(rename_all = "snake_case"))]
pub enum Backoff {
    /// Every retry waits the base delay.
    ///
    /// **Example with `2s` base delay:** `2s, 2s, 2s, ...`
    Constant,

    /// The delay grows by the base delay with each attempt.
    ///
    /// **Example with `2s` base delay:** `2s, 4s, 6s, 8s, ...`
    Linear,

    /// The delay is multiplied by the multiplier with each attempt.
    ///
    /// **Example with `2s` base delay and multiplier `2`:** `2s, 4s, 8s, 16s, ...`
    Exponential,
}

/// Randomization applied on top of the computed delay.
///
/// [`Full`][Jitter::Full] and [`Equal`][Jitter::Equal] only ever shorten a delay.
/// [`Decorrelated`][Jitter::Decorrelated] only ever lengthens it, up to the maximum delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(any(feature = "serde", test), serde(rename_all = "snake_case"))]
pub enum Jitter {
    /// The computed delay is used as is.
    None,

    /// With ratio `r`, the delay is drawn from `[x * (1 - r), x]`.
    ///
    /// With `r = 1` this is the classic full jitter, `uniform(0, x)`.
    Full,

    /// With ratio `r`, the delay is drawn from `[x * (1 - r / 2), x]`.
    ///
    /// With `r = 1` this is the classic equal jitter, `x / 2 + uniform(0, x / 2)`.
    Equal,

    /// With ratio `r`, the delay is drawn from `[x, x + r * (min(3x, max) - x)]`.
    ///
    /// This is a stateless take on decorrelated jitter: the spread grows with the
    /// computed delay rather than with the previous draw.
    Decorrelated,
}

/// A complete delay schedule: the growth kind, its bounds, and jitter.
///
/// [`delay`][BackoffSpec::delay] is a pure function of the attempt number apart
/// from the jitter draw, and can be called from any number of threads at once.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use rebound::{Backoff, BackoffSpec, Jitter};
///
/// let spec = BackoffSpec::new(Backoff::Exponential)
///     .base_delay(Duration::from_millis(10))
///     .multiplier(2.0)
///     .max_delay(Duration::from_millis(200))
///     .jitter(Jitter::None);
///
/// assert_eq!(spec.delay(1), Duration::from_millis(10));
/// assert_eq!(spec.delay(5), Duration::from_millis(160));
/// assert_eq!(spec.delay(6), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffSpec {
    backoff: Backoff,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
    jitter: Jitter,
    jitter_ratio: f64,
    rnd: Rnd,
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: Some(DEFAULT_MAX_DELAY),
            jitter: DEFAULT_JITTER,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            rnd: Rnd::default(),
        }
    }
}

impl BackoffSpec {
    /// Creates a schedule of the given kind with default bounds and jitter.
    #[must_use]
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff, ..Self::default() }
    }

    /// Sets the growth kind.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the exponential growth factor.
    ///
    /// Values below `1.0`, infinities, and NaN are treated as `1.0`.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() && multiplier >= 1.0 { multiplier } else { 1.0 };
        self
    }

    /// Sets the upper bound for any computed delay.
    ///
    /// A bound below the base delay is raised to the base delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Removes the upper bound; delays saturate at [`Duration::MAX`].
    #[must_use]
    pub fn unbounded(mut self) -> Self {
        self.max_delay = None;
        self
    }

    /// Sets the jitter mode.
    #[must_use]
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the jitter strength, clamped to `[0, 1]`.
    ///
    /// A ratio of `0` disables jitter.
    #[must_use]
    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        self
    }

    #[cfg(test)]
    pub(crate) fn with_rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }

    /// Returns the growth kind.
    #[must_use]
    pub fn kind(&self) -> Backoff {
        self.backoff
    }

    /// Returns the jitter mode.
    #[must_use]
    pub fn jitter_mode(&self) -> Jitter {
        self.jitter
    }

    /// Returns the base delay.
    #[must_use]
    pub fn get_base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the effective upper bound, if any.
    #[must_use]
    pub fn get_max_delay(&self) -> Option<Duration> {
        self.max_delay.map(|max| max.max(self.base_delay))
    }

    /// Returns the delay to wait after the `attempt`-th failed attempt (1-based).
    ///
    /// Attempt `0` is treated as attempt `1`. Overflow saturates at the maximum delay.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);

        let raw = match self.backoff {
            Backoff::Constant => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                scale_saturating(self.base_delay, self.multiplier.powi(exponent))
            }
        };

        let capped = self.get_max_delay().map_or(raw, |max| raw.min(max));

        self.apply_jitter(capped)
    }

    /// Returns the infinite schedule `delay(1), delay(2), ...`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=u32::MAX).map(move |attempt| self.delay(attempt))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let spread = match self.jitter {
            Jitter::None => return delay,
            Jitter::Full => self.jitter_ratio,
            Jitter::Equal => self.jitter_ratio / 2.0,
            Jitter::Decorrelated => return self.decorrelate(delay),
        };

        if spread <= 0.0 || delay.is_zero() {
            return delay;
        }

        let reduction = spread * self.rnd.next_f64();
        scale_saturating(delay, 1.0 - reduction).min(delay)
    }

    fn decorrelate(&self, delay: Duration) -> Duration {
        let tripled = delay.saturating_mul(3);
        let high = self.get_max_delay().map_or(tripled, |max| tripled.min(max));
        let span = high.saturating_sub(delay);

        if self.jitter_ratio <= 0.0 || span.is_zero() {
            return delay;
        }

        let extra = scale_saturating(span, self.jitter_ratio * self.rnd.next_f64()).min(span);
        delay.saturating_add(extra)
    }
}

/// Multiplies a duration by a non-negative factor, rounding to the nearest nanosecond.
///
/// Results that do not fit saturate at [`Duration::MAX`].
#[expect(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "the product is range-checked before the cast back to integer nanoseconds"
)]
fn scale_saturating(duration: Duration, factor: f64) -> Duration {
    let nanos = duration.as_nanos() as f64 * factor;

    if nanos.is_nan() || nanos <= 0.0 {
        return Duration::ZERO;
    }

    if nanos < u64::MAX as f64 {
        return Duration::from_nanos(nanos.round() as u64);
    }

    Duration::try_from_secs_f64(nanos / 1e9).unwrap_or(Duration::MAX)
}
