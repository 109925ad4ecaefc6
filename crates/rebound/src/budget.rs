// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tick::{Clock, Stopwatch};

/// A pool of attempts and wall-clock time shared by one or more invocations.
///
/// Every executed attempt takes one unit from each budget involved in the call.
/// Grants are decided by a single atomic decrement, so a budget of `K` attempts
/// grants exactly `K` units no matter how many callers race for them.
///
/// Exhaustion is permanent: once [`try_consume`][Budget::try_consume] refuses, it
/// keeps refusing for the rest of the budget's life.
///
/// Cloning a `Budget` yields another handle to the same pool.
///
/// # Examples
///
/// ```
/// use rebound::Budget;
/// use tick::Clock;
///
/// let clock = Clock::new_frozen();
/// let budget = Budget::attempts(&clock, 2);
///
/// assert!(budget.try_consume());
/// assert!(budget.clone().try_consume());
/// assert!(!budget.try_consume());
/// assert!(budget.is_exhausted());
/// ```
#[derive(Debug, Clone)]
pub struct Budget {
    inner: Arc<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    max_attempts: Option<u32>,
    max_elapsed: Option<Duration>,
    remaining: AtomicU32,
    consumed: AtomicU64,
    exhausted: AtomicBool,
    stopwatch: Stopwatch,
}

impl Budget {
    /// Creates a budget. `None` leaves the corresponding dimension unbounded.
    ///
    /// The elapsed-time ceiling is measured from this call.
    #[must_use]
    pub fn new(clock: &Clock, max_attempts: Option<u32>, max_elapsed: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                max_attempts,
                max_elapsed,
                remaining: AtomicU32::new(max_attempts.unwrap_or(u32::MAX)),
                consumed: AtomicU64::new(0),
                exhausted: AtomicBool::new(false),
                stopwatch: clock.stopwatch(),
            }),
        }
    }

    /// Creates a budget of `max_attempts` attempts without a time ceiling.
    #[must_use]
    pub fn attempts(clock: &Clock, max_attempts: u32) -> Self {
        Self::new(clock, Some(max_attempts), None)
    }

    /// Creates a budget bounded only by elapsed time.
    #[must_use]
    pub fn elapsed(clock: &Clock, max_elapsed: Duration) -> Self {
        Self::new(clock, None, Some(max_elapsed))
    }

    /// Creates a budget that never refuses.
    #[must_use]
    pub fn unlimited(clock: &Clock) -> Self {
        Self::new(clock, None, None)
    }

    /// Takes one attempt from the budget.
    ///
    /// Returns `false` when no attempts remain or the elapsed-time ceiling has been
    /// reached. After the first refusal the budget is exhausted for good.
    pub fn try_consume(&self) -> bool {
        let inner = &*self.inner;

        if inner.exhausted.load(Ordering::Acquire) {
            return false;
        }

        if inner.past_deadline() {
            inner.exhausted.store(true, Ordering::Release);
            return false;
        }

        let granted = match inner.max_attempts {
            None => true,
            Some(_) => inner
                .remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| remaining.checked_sub(1))
                .is_ok(),
        };

        if granted {
            inner.consumed.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.exhausted.store(true, Ordering::Release);
        }

        granted
    }

    /// Time left before the elapsed-time ceiling, or `None` when there is no ceiling.
    #[must_use]
    pub fn remaining_time(&self) -> Option<Duration> {
        self.inner
            .max_elapsed
            .map(|max| max.saturating_sub(self.inner.stopwatch.elapsed()))
    }

    /// Attempts left, or `None` when attempts are unbounded.
    #[must_use]
    pub fn remaining_attempts(&self) -> Option<u32> {
        self.inner.max_attempts.map(|_| self.inner.remaining.load(Ordering::Acquire))
    }

    /// Number of attempts granted so far.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.inner.consumed.load(Ordering::Relaxed)
    }

    /// Whether the budget has refused a request.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.inner.exhausted.load(Ordering::Acquire)
    }

    /// Time since the budget was created.
    #[must_use]
    pub fn elapsed_time(&self) -> Duration {
        self.inner.stopwatch.elapsed()
    }
}

impl BudgetInner {
    fn past_deadline(&self) -> bool {
        self.max_elapsed.is_some_and(|max| self.stopwatch.elapsed() >= max)
    }
}
