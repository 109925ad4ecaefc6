// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug, Display};
use std::pin::pin;
use std::time::{Duration, SystemTime};

use futures_util::future::{Either, select};
use recoverable::{RecoveryInfo, RecoveryKind};
use tick::{FutureExt as _, Stopwatch};
use tokio_util::sync::CancellationToken;

use super::{Execution, InFlight, OperationContext, Retrier, RetrierInner, TimeoutArgs};
use crate::hooks::guarded;
use crate::{
    Attempt, AttemptOutcome, Budget, Claim, Completion, ErrorKind, ExhaustionReason, Failure, HookContext, Hooks, IdempotencyKey,
    IdempotencyStore, Lease, RecordState, RetryError, StoreError,
};

/// A single call through a [`Retrier`], with per-call settings.
///
/// Created by [`Retrier::invoke`]; run it with [`execute`][Self::execute].
pub struct Invocation<'a, T, E, S> {
    retrier: &'a Retrier<T, E, S>,
    key: Option<IdempotencyKey>,
    budget: Option<Budget>,
    cancellation: Option<CancellationToken>,
    deadline: Option<Duration>,
}

impl<'a, T, E, S> Invocation<'a, T, E, S> {
    pub(super) fn new(retrier: &'a Retrier<T, E, S>) -> Self {
        Self {
            retrier,
            key: None,
            budget: retrier.inner.budget.clone(),
            cancellation: None,
            deadline: None,
        }
    }

    /// Runs the operation at most once per `key` across every caller sharing the store.
    #[must_use]
    pub fn key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Charges this call against `budget` instead of the retrier's shared budget.
    #[must_use]
    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Stops the call when `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Stops the call once `timeout` has passed since [`execute`][Self::execute] started.
    #[must_use]
    pub fn deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(timeout);
        self
    }
}

impl<T, E, S> Debug for Invocation<'_, T, E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("retrier", &self.retrier.inner.name)
            .field("key", &self.key)
            .field("budget", &self.budget)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<T, E, S> Invocation<'_, T, E, S>
where
    T: Clone + Send + Sync + 'static,
    E: Display,
    S: IdempotencyStore<T>,
{
    /// Runs `operation` until it succeeds or the retrier gives up.
    ///
    /// `operation` is called once per attempt with a fresh [`OperationContext`].
    pub async fn execute<F, Fut>(self, operation: F) -> Execution<T, E>
    where
        F: FnMut(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let inner = &*self.retrier.inner;

        let run = Run {
            inner,
            stopwatch: inner.clock.stopwatch(),
            private: Budget::new(&inner.clock, inner.max_attempts.limit(), inner.max_elapsed),
            shared: self.budget,
            token: self
                .cancellation
                .as_ref()
                .map_or_else(CancellationToken::new, CancellationToken::child_token),
            deadline: self.deadline,
            key: self.key,
            lease: None,
            attempts: Vec::new(),
        };

        run.execute(operation).await
    }
}

impl<T, E, S> Retrier<T, E, S>
where
    T: Clone + Send + Sync + 'static,
    E: Display,
    S: IdempotencyStore<T>,
{
    /// Runs `operation` without a key, budget override, or cancellation.
    ///
    /// Shortcut for `self.invoke().execute(operation)`.
    pub async fn execute<F, Fut>(&self, operation: F) -> Execution<T, E>
    where
        F: FnMut(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke().execute(operation).await
    }
}

/// How resolving the idempotency key ended.
enum Acquired<T> {
    Lease(Lease),
    Replayed(Result<T, Failure>),
    Conflict,
    Cancelled,
    Store(StoreError),
}

/// State of one invocation.
struct Run<'a, T, E, S> {
    inner: &'a RetrierInner<T, E, S>,
    stopwatch: Stopwatch,
    private: Budget,
    shared: Option<Budget>,
    token: CancellationToken,
    deadline: Option<Duration>,
    key: Option<IdempotencyKey>,
    lease: Option<Lease>,
    attempts: Vec<Attempt>,
}

impl<T, E, S> Run<'_, T, E, S>
where
    T: Clone + Send + Sync + 'static,
    E: Display,
    S: IdempotencyStore<T>,
{
    async fn execute<F, Fut>(mut self, operation: F) -> Execution<T, E>
    where
        F: FnMut(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(key) = self.key.clone() {
            match self.acquire(&key).await {
                Acquired::Lease(lease) => self.lease = Some(lease),
                Acquired::Replayed(result) => {
                    self.inner.telemetry.replayed(&key);
                    return self.finish(result.map_err(RetryError::replayed), true);
                }
                Acquired::Conflict => {
                    let kind = ErrorKind::IdempotencyConflict;
                    self.inner.telemetry.failed(kind, 0);
                    return self.finish(Err(RetryError::new(kind, 0, None)), false);
                }
                Acquired::Cancelled => return self.exhausted(ExhaustionReason::Cancelled, None).await,
                Acquired::Store(error) => {
                    self.inner.telemetry.store_failed(&key, &error);
                    self.inner.telemetry.failed(ErrorKind::Store, 0);
                    return self.finish(Err(RetryError::store(error, 0)), false);
                }
            }
        }

        // the holder renews its claim while attempts run
        match self.lease.clone() {
            Some(lease) => {
                let inner = self.inner;
                let attempts = pin!(self.run_attempts(operation));

                match select(attempts, pin!(keep_alive(inner, lease))).await {
                    Either::Left((execution, _)) => execution,
                    Either::Right(((), attempts)) => attempts.await,
                }
            }
            None => self.run_attempts(operation).await,
        }
    }

    async fn run_attempts<F, Fut>(mut self, mut operation: F) -> Execution<T, E>
    where
        F: FnMut(OperationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.is_interrupted() {
            self.token.cancel();
            return self.exhausted(ExhaustionReason::Cancelled, None).await;
        }

        if !self.charge() {
            return self.exhausted(ExhaustionReason::BudgetExhausted, None).await;
        }

        let mut index = 1;

        loop {
            self.fire("on_attempt", |hooks, context| hooks.on_attempt(context, index));

            let started_at = self.inner.clock.system_time();
            let context = OperationContext {
                attempt: index,
                key: self.key.clone(),
                cancellation: self.token.clone(),
            };
            let result = self.attempt(operation(context), index).await;
            let ended_at = self.inner.clock.system_time();

            let error = match result {
                None => {
                    self.record(index, started_at, ended_at, AttemptOutcome::Cancelled, None);
                    return self.exhausted(ExhaustionReason::Cancelled, None).await;
                }
                Some(Ok(value)) => {
                    self.record(index, started_at, ended_at, AttemptOutcome::Succeeded, None);
                    return self.succeeded(value, index).await;
                }
                Some(Err(error)) => error,
            };

            let recovery = self.inner.classifier.classify(&error, index);

            if !self.is_retryable(&recovery) {
                self.record(index, started_at, ended_at, AttemptOutcome::Failed(recovery), None);
                return self.exhausted(ExhaustionReason::NonRetryable, Some(error)).await;
            }

            if self.should_stop(&error, index) {
                self.record(index, started_at, ended_at, AttemptOutcome::Failed(recovery), None);
                return self.exhausted(ExhaustionReason::Stopped, Some(error)).await;
            }

            if !self.charge() {
                self.record(index, started_at, ended_at, AttemptOutcome::Failed(recovery), None);
                return self.exhausted(ExhaustionReason::BudgetExhausted, Some(error)).await;
            }

            let delay = self.next_delay(index, &recovery);
            self.record(index, started_at, ended_at, AttemptOutcome::Failed(recovery), Some(delay));

            self.fire("on_retry_scheduled", |hooks, context| {
                hooks.on_retry_scheduled(context, index, delay, &error);
            });
            self.inner.telemetry.retry_scheduled(index, delay);

            if self.race(self.inner.clock.delay(delay)).await.is_none() {
                return self.exhausted(ExhaustionReason::Cancelled, Some(error)).await;
            }

            index = index.saturating_add(1);
        }
    }

    /// Claims the key, or resolves the call from the record that holds it.
    #[cfg_attr(test, mutants::skip)] // causes test timeouts
    async fn acquire(&self, key: &IdempotencyKey) -> Acquired<T> {
        let store = &*self.inner.store;

        loop {
            let record = match self.race(store.claim(key, self.inner.idempotency_lease)).await {
                None => return Acquired::Cancelled,
                Some(Err(error)) => return Acquired::Store(error),
                Some(Ok(Claim::Won(lease))) => return Acquired::Lease(lease),
                Some(Ok(Claim::Lost(record))) => record,
            };

            let state = match record.into_state() {
                RecordState::InProgress if self.inner.in_flight == InFlight::FailFast => return Acquired::Conflict,
                RecordState::InProgress => match self.race(store.wait(key)).await {
                    None => return Acquired::Cancelled,
                    Some(Err(error)) => return Acquired::Store(error),
                    // lease lapsed or record removed, claim again
                    Some(Ok(None)) => continue,
                    Some(Ok(Some(record))) => record.into_state(),
                },
                terminal => terminal,
            };

            match state {
                RecordState::InProgress => {}
                RecordState::Succeeded(value) => return Acquired::Replayed(Ok(value)),
                RecordState::Failed(failure) => return Acquired::Replayed(Err(failure)),
            }
        }
    }

    async fn attempt<Fut>(&self, operation: Fut, index: u32) -> Option<Result<T, E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let Some((timeout, error)) = &self.inner.attempt_timeout else {
            return self.race(operation).await;
        };

        let result = self.race(operation.timeout(&self.inner.clock, *timeout)).await?;

        Some(result.unwrap_or_else(|_timed_out| {
            Err(error.call(TimeoutArgs {
                attempt: index,
                timeout: *timeout,
            }))
        }))
    }

    async fn succeeded(mut self, value: T, index: u32) -> Execution<T, E> {
        if let Some(lease) = self.lease.take() {
            self.complete(&lease, Completion::Succeeded(value.clone())).await;
        }

        let elapsed = self.stopwatch.elapsed();
        self.fire("on_success", |hooks, context| hooks.on_success(context, index, elapsed));
        self.inner.telemetry.succeeded(index);

        self.finish(Ok(value), false)
    }

    async fn exhausted(mut self, reason: ExhaustionReason, error: Option<E>) -> Execution<T, E> {
        let kind = ErrorKind::from(reason);
        let attempts = self.attempt_count();

        if let Some(lease) = self.lease.take() {
            let message = error.as_ref().map_or_else(|| kind.to_string(), ToString::to_string);
            self.complete(&lease, Completion::Failed(Failure::new(kind, message))).await;
        }

        self.fire("on_exhausted", |hooks, context| hooks.on_exhausted(context, reason, error.as_ref()));
        self.inner.telemetry.failed(kind, attempts);

        self.finish(Err(RetryError::new(kind, attempts, error)), false)
    }

    /// Moves the claimed record to its terminal state. Store failures are reported, not returned.
    async fn complete(&self, lease: &Lease, completion: Completion<T>) {
        if let Err(error) = self.inner.store.complete(lease, completion, self.inner.idempotency_ttl).await {
            self.inner.telemetry.store_failed(lease.key(), &error);
        }
    }

    fn finish(self, outcome: Result<T, RetryError<E>>, replayed: bool) -> Execution<T, E> {
        Execution {
            outcome,
            elapsed: self.stopwatch.elapsed(),
            attempts: self.attempts,
            replayed,
        }
    }
}

/// Renews `lease` every half lease period until the store refuses.
#[cfg_attr(test, mutants::skip)] // causes test timeouts
async fn keep_alive<T, E, S: IdempotencyStore<T>>(inner: &RetrierInner<T, E, S>, lease: Lease) {
    let period = inner.idempotency_lease / 2;
    if period.is_zero() {
        return;
    }

    loop {
        inner.clock.delay(period).await;

        if let Err(error) = inner.store.renew(&lease, inner.idempotency_lease).await {
            inner.telemetry.store_failed(lease.key(), &error);
            return;
        }
    }
}

impl<T, E, S> Run<'_, T, E, S> {
    fn is_retryable(&self, recovery: &RecoveryInfo) -> bool {
        match recovery.kind() {
            RecoveryKind::Retry => true,
            RecoveryKind::Unavailable => self.inner.handle_unavailable,
            _ => false,
        }
    }

    fn should_stop(&self, error: &E, index: u32) -> bool {
        self.inner
            .stopper
            .as_ref()
            .is_some_and(|stopper| stopper.should_stop(error, index, self.stopwatch.elapsed()))
    }

    /// Takes one unit from the private budget and from the shared one, if any.
    #[cfg_attr(test, mutants::skip)] // unbounded retries hang the tests
    fn charge(&self) -> bool {
        self.private.try_consume() && self.shared.as_ref().is_none_or(Budget::try_consume)
    }

    fn next_delay(&self, index: u32, recovery: &RecoveryInfo) -> Duration {
        let backoff = self.inner.backoff.delay(index);
        let delay = recovery.get_delay().map_or(backoff, |hint| hint.max(backoff));

        [Some(&self.private), self.shared.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(Budget::remaining_time)
            .fold(delay, Duration::min)
    }

    fn record(&mut self, index: u32, started_at: SystemTime, ended_at: SystemTime, outcome: AttemptOutcome, delay: Option<Duration>) {
        self.attempts.push(Attempt::new(index, started_at, ended_at, outcome, delay));
    }

    fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    fn fire(&self, hook: &'static str, f: impl FnOnce(&dyn Hooks<E>, &HookContext<'_>)) {
        let Some(hooks) = &self.inner.hooks else {
            return;
        };

        let context = HookContext {
            operation: &self.inner.name,
            key: self.key.as_ref(),
            attempts: &self.attempts,
        };

        guarded(&self.inner.telemetry, hook, || f(hooks.as_ref(), &context));
    }

    fn deadline_left(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_sub(self.stopwatch.elapsed()))
    }

    fn is_interrupted(&self) -> bool {
        self.token.is_cancelled() || self.deadline_left() == Some(Duration::ZERO)
    }

    /// Resolves when the invocation is cancelled or its deadline passes.
    async fn interrupted(&self) {
        let cancelled = pin!(self.token.cancelled());

        match self.deadline_left() {
            Some(left) => {
                _ = select(cancelled, pin!(self.inner.clock.delay(left))).await;
            }
            None => cancelled.await,
        }
    }

    /// Drives `future` unless the invocation is interrupted first.
    ///
    /// On interruption the invocation's token is cancelled so the operation sees it.
    async fn race<F: Future>(&self, future: F) -> Option<F::Output> {
        if self.is_interrupted() {
            self.token.cancel();
            return None;
        }

        match select(pin!(future), pin!(self.interrupted())).await {
            Either::Left((output, _)) => Some(output),
            Either::Right(((), _)) => {
                self.token.cancel();
                None
            }
        }
    }
}
