// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The retrying executor.
//!
//! A [`Retrier`] runs an async operation until it succeeds, the error classifier
//! declares an error terminal, a budget refuses another attempt, or the caller
//! cancels. Between attempts it waits according to its [`BackoffSpec`][crate::BackoffSpec].
//!
//! With an idempotency key, the retrier first claims the key in its
//! [`IdempotencyStore`][crate::IdempotencyStore]. Only the claim winner runs the
//! operation; other callers are answered with the stored result.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use rebound::{Classifier, Context, Jitter, Retrier};
//! use tick::Clock;
//!
//! # async fn example(clock: Clock) {
//! let context = Context::new(&clock);
//!
//! let retrier = Retrier::builder("fetch_profile", &context)
//!     .max_attempts(5)
//!     .base_delay(Duration::from_millis(20))
//!     .jitter(Jitter::Full)
//!     .classifier(Classifier::predicate(|e: &std::io::Error| e.kind() == std::io::ErrorKind::TimedOut))
//!     .build();
//!
//! let execution = retrier.execute(|_context| async { Ok::<_, std::io::Error>("profile") }).await;
//!
//! assert_eq!(execution.into_result().ok(), Some("profile"));
//! # }
//! ```

mod args;
mod builder;
mod execution;
mod invocation;

use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub use args::{OperationContext, TimeoutArgs};
pub use builder::RetryBuilder;
pub use execution::Execution;
pub use invocation::Invocation;
use tick::Clock;

use crate::define_fn_wrapper::define_fn_wrapper;
use crate::telemetry::TelemetryHelper;
use crate::{BackoffSpec, Budget, Classifier, Context, Hooks, InMemoryStore, MaxAttempts, Stopper};

define_fn_wrapper!(TimeoutErrorFn<E>(Fn(TimeoutArgs) -> E));

/// What to do when the idempotency key is already being executed elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum InFlight {
    /// Wait for the running execution and return its result.
    #[default]
    Wait,

    /// Return [`ErrorKind::IdempotencyConflict`][crate::ErrorKind::IdempotencyConflict] immediately.
    FailFast,
}

/// Runs fallible async operations with retries, budgets, and idempotency.
///
/// Build one with [`Retrier::builder`]. A `Retrier` is cheap to clone; clones share
/// configuration, hooks, the shared budget, and the idempotency store.
///
/// `T` is the operation's value, `E` its error, and `S` the idempotency store.
pub struct Retrier<T, E, S = InMemoryStore<T>> {
    pub(crate) inner: Arc<RetrierInner<T, E, S>>,
}

pub(crate) struct RetrierInner<T, E, S> {
    pub(crate) name: Cow<'static, str>,
    pub(crate) clock: Clock,
    pub(crate) max_attempts: MaxAttempts,
    pub(crate) max_elapsed: Option<Duration>,
    pub(crate) backoff: BackoffSpec,
    pub(crate) classifier: Classifier<E>,
    pub(crate) handle_unavailable: bool,
    pub(crate) hooks: Option<Arc<dyn Hooks<E>>>,
    pub(crate) store: Arc<S>,
    pub(crate) idempotency_ttl: Duration,
    pub(crate) idempotency_lease: Duration,
    pub(crate) in_flight: InFlight,
    pub(crate) budget: Option<Budget>,
    pub(crate) attempt_timeout: Option<(Duration, TimeoutErrorFn<E>)>,
    pub(crate) stopper: Option<Stopper<E>>,
    pub(crate) telemetry: TelemetryHelper,
    pub(crate) _value: PhantomData<fn() -> T>,
}

impl<T, E> Retrier<T, E, InMemoryStore<T>> {
    /// Starts configuring a retrier named `name`.
    ///
    /// The name identifies the retrier in logs, metrics, and hooks; prefer `snake_case`.
    /// The retrier gets its own [`InMemoryStore`] unless
    /// [`idempotency_store`][RetryBuilder::idempotency_store] supplies one.
    pub fn builder(name: impl Into<Cow<'static, str>>, context: &Context) -> RetryBuilder<T, E> {
        RetryBuilder::new(name.into(), context)
    }
}

impl<T, E, S> Retrier<T, E, S> {
    /// The retrier's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The budget shared by every invocation of this retrier, if configured.
    #[must_use]
    pub fn budget(&self) -> Option<&Budget> {
        self.inner.budget.as_ref()
    }

    /// The idempotency store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// The per-invocation time ceiling, if configured.
    #[must_use]
    pub fn max_elapsed(&self) -> Option<Duration> {
        self.inner.max_elapsed
    }

    /// Starts an invocation that can be given a key, budget, cancellation, or deadline.
    #[must_use]
    pub fn invoke(&self) -> Invocation<'_, T, E, S> {
        Invocation::new(self)
    }
}

impl<T, E, S> Clone for Retrier<T, E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E, S: Debug> Debug for Retrier<T, E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.inner;
        f.debug_struct("Retrier")
            .field("name", &inner.name)
            .field("max_attempts", &inner.max_attempts)
            .field("max_elapsed", &inner.max_elapsed)
            .field("backoff", &inner.backoff)
            .field("handle_unavailable", &inner.handle_unavailable)
            .field("in_flight", &inner.in_flight)
            .field("budget", &inner.budget)
            .field("stopper", &inner.stopper)
            .field("store", &inner.store)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use tick::Clock;

    use super::*;

    #[test]
    fn static_assertions() {
        static_assertions::assert_impl_all!(Retrier<String, std::io::Error>: Send, Sync, Clone, Debug);
        static_assertions::assert_impl_all!(InFlight: Send, Sync, Copy);
    }

    #[test]
    fn in_flight_defaults_to_wait() {
        assert_eq!(InFlight::default(), InFlight::Wait);
    }

    #[test]
    fn clones_share_state() {
        let clock = Clock::new_frozen();
        let budget = Budget::attempts(&clock, 3);
        let retrier = Retrier::<u32, String>::builder("orders", &Context::new(&clock)).budget(budget).build();
        let clone = retrier.clone();

        assert_eq!(clone.name(), "orders");
        assert!(Arc::ptr_eq(retrier.store(), clone.store()));
        assert_eq!(clone.budget().and_then(Budget::remaining_attempts), Some(3));
        assert_eq!(clone.max_elapsed(), None);
    }

    #[test]
    fn debug_lists_configuration() {
        let clock = Clock::new_frozen();
        let retrier = Retrier::<u32, String>::builder("orders", &Context::new(&clock)).build();
        let debug = format!("{retrier:?}");

        assert!(debug.starts_with("Retrier {"));
        assert!(debug.contains("orders"));
        assert!(debug.contains("InMemoryStore"));
    }
}
