// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded-parallelism fan-out over one shared budget.
//!
//! A [`Batch`] runs one invocation of a [`Retrier`] per input. At most
//! `parallelism` invocations are in flight at once, all on the caller's task, and
//! every attempt of every item is charged to the same [`Budget`].
//!
//! # Fairness
//!
//! Budget units are granted first come, first served at the moment an attempt asks
//! for one. Items are started in submission order, so while units remain every
//! started item is granted its first attempt before any later item; when the budget
//! runs dry the items that got attempts form a prefix of the submission order. A
//! unit is never refused while one remains.

use std::fmt::Display;
use std::num::NonZeroUsize;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::define_fn_wrapper::define_fn_wrapper;
use crate::{
    Budget, ErrorKind, Execution, IdempotencyKey, IdempotencyStore, OperationContext, Retrier, RetryConfig, RetryError,
};

define_fn_wrapper!(KeyFn<I>(Fn(&I) -> IdempotencyKey));

/// Runs many inputs through one [`Retrier`].
///
/// Created by [`Retrier::batch`]. By default the batch:
///
/// - runs as many items at once as [`std::thread::available_parallelism`] reports,
/// - keeps going after failed items,
/// - shares the retrier's budget, or else a fresh one bounded only by the
///   retrier's elapsed-time ceiling.
///
/// # Examples
///
/// ```
/// use rebound::{Budget, Classifier, Context, Retrier};
/// use tick::Clock;
///
/// # async fn example(clock: Clock) {
/// let retrier = Retrier::builder("publish", &Context::new(&clock))
///     .classifier(Classifier::always())
///     .build();
///
/// let report = retrier
///     .batch()
///     .parallelism(4)
///     .budget(Budget::attempts(&clock, 20))
///     .key_with(|message: &u64| format!("message-{message}").into())
///     .run([1_u64, 2, 3], |message, _context| {
///         let message = *message;
///         async move { Ok::<_, std::io::Error>(message * 10) }
///     })
///     .await;
///
/// assert!(report.is_success());
/// # }
/// ```
pub struct Batch<'a, T, E, S, I> {
    retrier: &'a Retrier<T, E, S>,
    parallelism: Option<usize>,
    abort_on_first_failure: bool,
    budget: Option<Budget>,
    key_fn: Option<KeyFn<I>>,
    cancellation: Option<CancellationToken>,
}

impl<T, E, S> Retrier<T, E, S> {
    /// Starts configuring a batch run.
    #[must_use]
    pub fn batch<I>(&self) -> Batch<'_, T, E, S, I> {
        Batch {
            retrier: self,
            parallelism: None,
            abort_on_first_failure: false,
            budget: None,
            key_fn: None,
            cancellation: None,
        }
    }
}

impl<T, E, S, I> Batch<'_, T, E, S, I> {
    /// Maximum number of items in flight. Values below 1 are raised to 1.
    #[must_use]
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism.max(1));
        self
    }

    /// Cancels the remaining items once any item fails or exhausts its budget.
    #[must_use]
    pub fn abort_on_first_failure(mut self, enable: bool) -> Self {
        self.abort_on_first_failure = enable;
        self
    }

    /// The budget every attempt of every item is charged to.
    #[must_use]
    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Derives an idempotency key from each input.
    #[must_use]
    pub fn key_with(mut self, key_fn: impl Fn(&I) -> IdempotencyKey + Send + Sync + 'static) -> Self {
        self.key_fn = Some(KeyFn::new(key_fn));
        self
    }

    /// Cancels every unfinished item when `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Applies the batch settings of `config`.
    #[must_use]
    pub fn config(mut self, config: &RetryConfig) -> Self {
        self.parallelism = config.parallelism.map(|parallelism| parallelism.max(1));
        self.abort_on_first_failure = config.abort_on_first_failure;
        self
    }
}

impl<T, E, S, I> Batch<'_, T, E, S, I>
where
    T: Clone + Send + Sync + 'static,
    E: Display,
    S: IdempotencyStore<T>,
{
    /// Runs `operation` for every input and waits for all of them.
    ///
    /// The report lists the items in submission order.
    pub async fn run<F, Fut>(self, inputs: impl IntoIterator<Item = I>, operation: F) -> BatchReport<T, E>
    where
        F: Fn(&I, OperationContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let retrier = self.retrier;
        let parallelism = self
            .parallelism
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get));
        let budget = self
            .budget
            .or_else(|| retrier.budget().cloned())
            .unwrap_or_else(|| Budget::new(&retrier.inner.clock, None, retrier.max_elapsed()));
        let token = self
            .cancellation
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let abort_on_first_failure = self.abort_on_first_failure;
        let key_fn = self.key_fn.as_ref();
        let operation = &operation;

        let mut items: Vec<ItemOutcome<T, E>> = stream::iter(inputs.into_iter().enumerate())
            .map(|(index, input)| {
                let key = key_fn.map(|key_fn| key_fn.call(&input));
                let budget = budget.clone();
                let token = token.clone();

                async move {
                    let mut invocation = retrier.invoke().budget(budget).cancellation(token.clone());
                    if let Some(key) = &key {
                        invocation = invocation.key(key.clone());
                    }

                    let execution = invocation.execute(|context| operation(&input, context)).await;
                    let item = ItemOutcome { index, key, execution };

                    if abort_on_first_failure && matches!(item.status(), ItemStatus::Failed | ItemStatus::Exhausted) {
                        token.cancel();
                    }

                    item
                }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        items.sort_by_key(|item| item.index);

        BatchReport { items }
    }
}

impl<T, E, S, I> std::fmt::Debug for Batch<'_, T, E, S, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("retrier", &self.retrier.name())
            .field("parallelism", &self.parallelism)
            .field("abort_on_first_failure", &self.abort_on_first_failure)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

/// How a batch item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ItemStatus {
    /// The operation produced a value, or a stored value was replayed.
    Succeeded,

    /// The item ended with a terminal error other than budget exhaustion or cancellation.
    Failed,

    /// A budget refused the item's next attempt, or a stopper ended it.
    Exhausted,

    /// The batch was cancelled or aborted before the item finished.
    Cancelled,
}

/// The result of one batch item.
#[derive(Debug)]
pub struct ItemOutcome<T, E> {
    index: usize,
    key: Option<IdempotencyKey>,
    execution: Execution<T, E>,
}

impl<T, E> ItemOutcome<T, E> {
    /// Position of the item in the submitted inputs.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The idempotency key derived for the item, if any.
    #[must_use]
    pub fn key(&self) -> Option<&IdempotencyKey> {
        self.key.as_ref()
    }

    /// The item's execution, including its attempt history.
    #[must_use]
    pub fn execution(&self) -> &Execution<T, E> {
        &self.execution
    }

    /// Consumes the outcome and returns the execution.
    #[must_use]
    pub fn into_execution(self) -> Execution<T, E> {
        self.execution
    }

    /// How the item ended.
    #[must_use]
    pub fn status(&self) -> ItemStatus {
        match self.execution.outcome() {
            Ok(_) => ItemStatus::Succeeded,
            Err(error) => match error.kind() {
                ErrorKind::BudgetExhausted | ErrorKind::Stopped => ItemStatus::Exhausted,
                ErrorKind::Cancelled => ItemStatus::Cancelled,
                _ => ItemStatus::Failed,
            },
        }
    }
}

/// Per-item outcomes of a batch, in submission order.
#[derive(Debug)]
pub struct BatchReport<T, E> {
    items: Vec<ItemOutcome<T, E>>,
}

impl<T, E> BatchReport<T, E> {
    /// Every item, in submission order.
    #[must_use]
    pub fn items(&self) -> &[ItemOutcome<T, E>] {
        &self.items
    }

    /// Consumes the report and returns its items.
    #[must_use]
    pub fn into_items(self) -> Vec<ItemOutcome<T, E>> {
        self.items
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch had no inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether every item succeeded. True for an empty batch.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.items.iter().all(|item| item.status() == ItemStatus::Succeeded)
    }

    /// Items that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &ItemOutcome<T, E>> {
        self.items.iter().filter(|item| item.status() == ItemStatus::Succeeded)
    }

    /// Items that did not succeed, for whatever reason.
    pub fn failed(&self) -> impl Iterator<Item = &ItemOutcome<T, E>> {
        self.items.iter().filter(|item| item.status() != ItemStatus::Succeeded)
    }

    /// Attempts executed across the whole batch.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.items
            .iter()
            .map(|item| item.execution.attempt_count())
            .fold(0, u32::saturating_add)
    }

    /// Consumes the report and returns each item's result, in submission order.
    #[must_use]
    pub fn into_results(self) -> Vec<Result<T, RetryError<E>>> {
        self.items.into_iter().map(|item| item.execution.into_result()).collect()
    }
}
