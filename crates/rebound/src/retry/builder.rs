// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use recoverable::RecoveryInfo;
use tick::Clock;

use super::{InFlight, Retrier, RetrierInner, TimeoutArgs, TimeoutErrorFn};
use crate::constants::{DEFAULT_IDEMPOTENCY_LEASE, DEFAULT_IDEMPOTENCY_TTL, DEFAULT_MAX_ATTEMPTS};
use crate::telemetry::TelemetryHelper;
use crate::{
    Backoff, BackoffSpec, Budget, Classifier, ClassifyArgs, Context, Hooks, InMemoryStore, Jitter, MaxAttempts, RetryConfig, Stopper,
};

/// Configures a [`Retrier`].
///
/// Created by [`Retrier::builder`]. Defaults:
///
/// | Setting | Default |
/// |---|---|
/// | attempts | 4 |
/// | elapsed ceiling | none |
/// | backoff | exponential, base 50 ms, multiplier 2, max 30 s, full jitter |
/// | classifier | every error is terminal |
/// | unavailable errors | not retried |
/// | idempotency TTL / lease | 1 h / 60 s |
/// | in-flight policy | [`InFlight::Wait`] |
pub struct RetryBuilder<T, E, S = InMemoryStore<T>> {
    name: Cow<'static, str>,
    clock: Clock,
    max_attempts: MaxAttempts,
    max_elapsed: Option<Duration>,
    backoff: BackoffSpec,
    classifier: Classifier<E>,
    handle_unavailable: bool,
    hooks: Option<Arc<dyn Hooks<E>>>,
    store: Arc<S>,
    idempotency_ttl: Duration,
    idempotency_lease: Duration,
    in_flight: InFlight,
    budget: Option<Budget>,
    attempt_timeout: Option<(Duration, TimeoutErrorFn<E>)>,
    stopper: Option<Stopper<E>>,
    telemetry: TelemetryHelper,
    _value: PhantomData<fn() -> T>,
}

impl<T, E> RetryBuilder<T, E> {
    pub(super) fn new(name: Cow<'static, str>, context: &Context) -> Self {
        Self {
            telemetry: context.create_telemetry(name.clone()),
            name,
            clock: context.clock().clone(),
            max_attempts: MaxAttempts::Finite(DEFAULT_MAX_ATTEMPTS),
            max_elapsed: None,
            backoff: BackoffSpec::default(),
            classifier: Classifier::never(),
            handle_unavailable: false,
            hooks: None,
            store: Arc::new(InMemoryStore::new(context.clock())),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            idempotency_lease: DEFAULT_IDEMPOTENCY_LEASE,
            in_flight: InFlight::Wait,
            budget: None,
            attempt_timeout: None,
            stopper: None,
            _value: PhantomData,
        }
    }
}

impl<T, E, S> RetryBuilder<T, E, S> {
    /// Caps the attempts of one invocation, counting the first. `0` never runs the operation.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = MaxAttempts::Finite(max_attempts);
        self
    }

    /// Removes the attempt cap. Pair with [`max_elapsed`][Self::max_elapsed], a budget,
    /// or a classifier that eventually gives up.
    #[must_use]
    pub fn infinite_attempts(mut self) -> Self {
        self.max_attempts = MaxAttempts::Infinite;
        self
    }

    /// Bounds the wall-clock time of one invocation, measured from its start.
    ///
    /// Delays are shortened to fit in the remaining time, and no attempt starts after it runs out.
    #[must_use]
    pub fn max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Sets the growth kind of the delay.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = self.backoff.backoff(backoff);
        self
    }

    /// Sets the jitter mode.
    #[must_use]
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.backoff = self.backoff.jitter(jitter);
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.backoff = self.backoff.base_delay(delay);
        self
    }

    /// Sets the largest delay between two attempts.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.backoff = self.backoff.max_delay(delay);
        self
    }

    /// Sets the growth factor of exponential backoff.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.backoff = self.backoff.multiplier(multiplier);
        self
    }

    /// Sets how much of each delay jitter may remove.
    #[must_use]
    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.backoff = self.backoff.jitter_ratio(ratio);
        self
    }

    /// Replaces the whole delay schedule.
    #[must_use]
    pub fn backoff_spec(mut self, backoff: BackoffSpec) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the error classifier.
    #[must_use]
    pub fn classifier(mut self, classifier: Classifier<E>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Classifies errors with a closure. Shortcut for `classifier(Classifier::new(f))`.
    #[must_use]
    pub fn classify_with(mut self, classify: impl Fn(&E, ClassifyArgs) -> RecoveryInfo + Send + Sync + 'static) -> Self {
        self.classifier = Classifier::new(classify);
        self
    }

    /// Whether errors classified as [`RecoveryKind::Unavailable`][recoverable::RecoveryKind::Unavailable]
    /// are retried. Off by default.
    #[must_use]
    pub fn handle_unavailable(mut self, enable: bool) -> Self {
        self.handle_unavailable = enable;
        self
    }

    /// Registers lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl Hooks<E> + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Uses `store` for idempotency records instead of a private [`InMemoryStore`].
    ///
    /// Share one store between retriers to deduplicate across them.
    #[must_use]
    pub fn idempotency_store<S2>(self, store: Arc<S2>) -> RetryBuilder<T, E, S2> {
        RetryBuilder {
            name: self.name,
            clock: self.clock,
            max_attempts: self.max_attempts,
            max_elapsed: self.max_elapsed,
            backoff: self.backoff,
            classifier: self.classifier,
            handle_unavailable: self.handle_unavailable,
            hooks: self.hooks,
            store,
            idempotency_ttl: self.idempotency_ttl,
            idempotency_lease: self.idempotency_lease,
            in_flight: self.in_flight,
            budget: self.budget,
            attempt_timeout: self.attempt_timeout,
            stopper: self.stopper,
            telemetry: self.telemetry,
            _value: PhantomData,
        }
    }

    /// How long a finished idempotency record answers duplicates.
    #[must_use]
    pub fn idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// How long a claim stays valid before another caller may take the key over.
    ///
    /// A running invocation renews its claim every half lease, so the lease only
    /// bounds how long an abandoned claim blocks the key.
    #[must_use]
    pub fn idempotency_lease(mut self, lease: Duration) -> Self {
        self.idempotency_lease = lease;
        self
    }

    /// What a keyed invocation does when the key is already in flight.
    #[must_use]
    pub fn in_flight(mut self, policy: InFlight) -> Self {
        self.in_flight = policy;
        self
    }

    /// Charges every attempt of every invocation against `budget` as well.
    #[must_use]
    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Bounds each attempt to `timeout`.
    ///
    /// A timed-out attempt is abandoned and replaced by the error `error` builds,
    /// which is then classified like any other error.
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration, error: impl Fn(TimeoutArgs) -> E + Send + Sync + 'static) -> Self {
        self.attempt_timeout = Some((timeout, TimeoutErrorFn::new(error)));
        self
    }

    /// Consults `stopper` after every retryable failure, before the next attempt is charged.
    #[must_use]
    pub fn stopper(mut self, stopper: Stopper<E>) -> Self {
        self.stopper = Some(stopper);
        self
    }

    /// Applies the retry settings of `config`.
    #[must_use]
    pub fn config(mut self, config: &RetryConfig) -> Self {
        self.max_attempts = config.max_attempts();
        self.max_elapsed = config.max_elapsed();
        self.backoff = config.backoff_spec();
        self.idempotency_ttl = config.idempotency_ttl();
        self.idempotency_lease = config.idempotency_lease();
        self
    }

    /// Creates the retrier.
    #[must_use]
    pub fn build(self) -> Retrier<T, E, S> {
        Retrier {
            inner: Arc::new(RetrierInner {
                name: self.name,
                clock: self.clock,
                max_attempts: self.max_attempts,
                max_elapsed: self.max_elapsed,
                backoff: self.backoff,
                classifier: self.classifier,
                handle_unavailable: self.handle_unavailable,
                hooks: self.hooks,
                store: self.store,
                idempotency_ttl: self.idempotency_ttl,
                idempotency_lease: self.idempotency_lease,
                in_flight: self.in_flight,
                budget: self.budget,
                attempt_timeout: self.attempt_timeout,
                stopper: self.stopper,
                telemetry: self.telemetry,
                _value: PhantomData,
            }),
        }
    }
}

impl<T, E, S> std::fmt::Debug for RetryBuilder<T, E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryBuilder")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
