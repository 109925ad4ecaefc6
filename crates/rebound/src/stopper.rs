// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stops retrying on signals that the error itself does not carry.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tick::Clock;

use crate::constants::ERR_POISONED_LOCK;
use crate::define_fn_wrapper::define_fn_wrapper;

define_fn_wrapper!(StopFn<E>(Fn(&E, StopArgs) -> bool));

/// Arguments passed to a stop closure.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct StopArgs {
    pub(crate) attempt: u32,
    pub(crate) elapsed: Duration,
}

impl StopArgs {
    /// The 1-based index of the attempt that just failed.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time since the invocation started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Ends an invocation after a retryable failure, before the next attempt is charged.
///
/// The retrier consults the stopper only for errors the classifier deemed
/// retryable. When it signals a stop, the invocation ends with
/// [`ErrorKind::Stopped`][crate::ErrorKind::Stopped] and keeps the last error.
///
/// Stoppers combine with [`or`][Self::or]: the combination stops as soon as any
/// part does, and later parts are not consulted.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use rebound::{Stopper, TokenBucket};
/// use tick::Clock;
///
/// let clock = Clock::new_frozen();
/// let bucket = TokenBucket::full(&clock, 10.0, 1.0);
///
/// let stopper = Stopper::<String>::new(|_, args| args.elapsed() > Duration::from_secs(5))
///     .or(Stopper::token_bucket(&bucket));
///
/// assert!(!stopper.should_stop(&"timeout".to_string(), 1, Duration::ZERO));
///
/// bucket.consume(10.0);
/// assert!(stopper.should_stop(&"timeout".to_string(), 2, Duration::ZERO));
/// ```
pub struct Stopper<E> {
    parts: Vec<StopFn<E>>,
}

impl<E> std::fmt::Debug for Stopper<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stopper").field("parts", &self.parts.len()).finish()
    }
}

impl<E> Clone for Stopper<E> {
    fn clone(&self) -> Self {
        Self { parts: self.parts.clone() }
    }
}

impl<E> Stopper<E> {
    /// Creates a stopper from a closure that returns `true` to stop.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&E, StopArgs) -> bool + Send + Sync + 'static,
    {
        Self {
            parts: vec![StopFn::new(f)],
        }
    }

    /// Stops while `bucket` has no whole token left.
    ///
    /// See [`TokenBucket::admit`] for how failures drain the bucket.
    #[must_use]
    pub fn token_bucket(bucket: &TokenBucket) -> Self {
        let bucket = bucket.clone();
        Self::new(move |_, _| !bucket.admit())
    }

    /// Combines two stoppers; the result stops when either does.
    #[must_use]
    pub fn or(mut self, other: Self) -> Self {
        self.parts.extend(other.parts);
        self
    }

    /// Combines any number of stoppers; the result stops when any of them does.
    #[must_use]
    pub fn any(stoppers: impl IntoIterator<Item = Self>) -> Self {
        Self {
            parts: stoppers.into_iter().flat_map(|stopper| stopper.parts).collect(),
        }
    }

    /// Whether retrying should stop after `attempt` failed with `error`.
    #[must_use]
    pub fn should_stop(&self, error: &E, attempt: u32, elapsed: Duration) -> bool {
        let args = StopArgs { attempt, elapsed };
        self.parts.iter().any(|part| part.call(error, args))
    }
}

/// A refilling pool of retry tokens shared by many invocations.
///
/// The bucket holds up to `capacity` tokens and regains `refill_per_second`
/// tokens every second, measured on the [`Clock`]. External signals can drain
/// it with [`consume`][Self::consume], for example when a latency objective is
/// breached, and top it up with [`add`][Self::add] once they clear.
///
/// Plugged into a retrier through [`Stopper::token_bucket`], retries halt while
/// fewer than one token is available and resume as the bucket refills.
///
/// Cloning yields another handle to the same bucket.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use rebound::TokenBucket;
/// use tick::ClockControl;
///
/// let control = ClockControl::new();
/// let bucket = TokenBucket::empty(&control.to_clock(), 5.0, 2.0);
/// assert!(!bucket.admit());
///
/// control.advance(Duration::from_secs(1));
/// assert!(bucket.admit());
/// assert!((bucket.tokens() - 2.0).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Clone)]
pub struct TokenBucket {
    clock: Clock,
    state: Arc<Mutex<BucketState>>,
}

#[derive(Debug)]
struct BucketState {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
    consume_per_failure: bool,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

        if elapsed > 0.0 && self.refill_per_second > 0.0 {
            self.tokens = elapsed.mul_add(self.refill_per_second, self.tokens).min(self.capacity);
        }

        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Creates a bucket that starts with `capacity` tokens.
    ///
    /// A capacity that is not positive becomes `1`. A negative or non-finite
    /// refill rate becomes `0`.
    #[must_use]
    pub fn full(clock: &Clock, capacity: f64, refill_per_second: f64) -> Self {
        Self::new(clock, capacity, refill_per_second, true)
    }

    /// Creates a bucket that starts without tokens.
    #[must_use]
    pub fn empty(clock: &Clock, capacity: f64, refill_per_second: f64) -> Self {
        Self::new(clock, capacity, refill_per_second, false)
    }

    fn new(clock: &Clock, capacity: f64, refill_per_second: f64, full: bool) -> Self {
        let capacity = sanitize_capacity(capacity);

        Self {
            clock: clock.clone(),
            state: Arc::new(Mutex::new(BucketState {
                capacity,
                refill_per_second: sanitize_rate(refill_per_second),
                tokens: if full { capacity } else { 0.0 },
                last_refill: clock.instant(),
                consume_per_failure: false,
            })),
        }
    }

    /// Makes every admitted retry take one token.
    ///
    /// The bucket then drains in proportion to the failure rate even without
    /// external signals.
    #[must_use]
    pub fn consume_per_failure(self, enabled: bool) -> Self {
        self.with_state(|state| state.consume_per_failure = enabled);
        self
    }

    /// Decides whether one more retry may proceed.
    ///
    /// Returns `false` while fewer than one token is available. With
    /// [`consume_per_failure`][Self::consume_per_failure] an admitted retry takes a token.
    pub fn admit(&self) -> bool {
        let now = self.clock.instant();

        self.with_state(|state| {
            state.refill(now);

            if state.tokens < 1.0 {
                return false;
            }

            if state.consume_per_failure {
                state.tokens -= 1.0;
            }

            true
        })
    }

    /// Removes up to `tokens` tokens. Non-positive amounts are ignored.
    pub fn consume(&self, tokens: f64) {
        if tokens.is_nan() || tokens <= 0.0 {
            return;
        }

        let now = self.clock.instant();
        self.with_state(|state| {
            state.refill(now);
            state.tokens = (state.tokens - tokens).max(0.0);
        });
    }

    /// Adds up to `tokens` tokens, bounded by the capacity. Non-positive amounts are ignored.
    pub fn add(&self, tokens: f64) {
        if tokens.is_nan() || tokens <= 0.0 {
            return;
        }

        let now = self.clock.instant();
        self.with_state(|state| {
            state.refill(now);
            state.tokens = (state.tokens + tokens).min(state.capacity);
        });
    }

    /// Changes the capacity and refill rate, after refilling at the old rate.
    pub fn reconfigure(&self, capacity: f64, refill_per_second: f64) {
        let now = self.clock.instant();
        self.with_state(|state| {
            state.refill(now);
            state.capacity = sanitize_capacity(capacity);
            state.refill_per_second = sanitize_rate(refill_per_second);
            state.tokens = state.tokens.min(state.capacity);
        });
    }

    /// Tokens currently available.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        let now = self.clock.instant();
        self.with_state(|state| {
            state.refill(now);
            state.tokens
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BucketState) -> R) -> R {
        f(&mut self.state.lock().expect(ERR_POISONED_LOCK))
    }
}

fn sanitize_capacity(capacity: f64) -> f64 {
    if capacity.is_finite() && capacity > 0.0 { capacity } else { 1.0 }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 { rate } else { 0.0 }
}
