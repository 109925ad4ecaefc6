// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Maps operation errors to a retry decision.

use std::time::Duration;

use recoverable::{Recovery, RecoveryInfo};

use crate::define_fn_wrapper::define_fn_wrapper;

define_fn_wrapper!(ClassifyFn<E>(Fn(&E, ClassifyArgs) -> RecoveryInfo));
define_fn_wrapper!(WaitHintFn<E>(Fn(&E) -> Option<Duration>));

/// Arguments passed to a classification closure.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct ClassifyArgs {
    pub(crate) attempt: u32,
}

impl ClassifyArgs {
    /// The 1-based index of the attempt that produced the error.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Decides whether an error is worth another attempt.
///
/// The classifier returns a [`RecoveryInfo`]:
///
/// - [`RecoveryKind::Retry`][recoverable::RecoveryKind::Retry] marks the error as transient.
/// - [`RecoveryKind::Never`][recoverable::RecoveryKind::Never] and
///   [`RecoveryKind::Unknown`][recoverable::RecoveryKind::Unknown] end the invocation.
/// - [`RecoveryKind::Unavailable`][recoverable::RecoveryKind::Unavailable] is retried
///   only when the retrier opts in via `handle_unavailable`.
///
/// A delay attached to the `RecoveryInfo` is a wait hint. The executor waits at
/// least that long before the next attempt.
///
/// The default classifier treats every error as terminal.
///
/// # Examples
///
/// ```
/// use rebound::{Classifier, RecoveryKind};
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum Kind {
///     Timeout,
///     Throttled,
///     Invalid,
/// }
///
/// let classifier = Classifier::allow_list(|e: &Kind| *e, [Kind::Timeout, Kind::Throttled]);
///
/// assert_eq!(classifier.classify(&Kind::Timeout, 1).kind(), RecoveryKind::Retry);
/// assert_eq!(classifier.classify(&Kind::Invalid, 1).kind(), RecoveryKind::Never);
/// ```
pub struct Classifier<E> {
    classify: ClassifyFn<E>,
    wait_hint: Option<WaitHintFn<E>>,
}

impl<E> std::fmt::Debug for Classifier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("wait_hint", &self.wait_hint.is_some())
            .finish_non_exhaustive()
    }
}

impl<E> Clone for Classifier<E> {
    fn clone(&self) -> Self {
        Self {
            classify: self.classify.clone(),
            wait_hint: self.wait_hint.clone(),
        }
    }
}

impl<E> Default for Classifier<E> {
    fn default() -> Self {
        Self::never()
    }
}

impl<E> Classifier<E> {
    /// Creates a classifier from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&E, ClassifyArgs) -> RecoveryInfo + Send + Sync + 'static,
    {
        Self {
            classify: ClassifyFn::new(f),
            wait_hint: None,
        }
    }

    /// A classifier that treats every error as terminal.
    #[must_use]
    pub fn never() -> Self {
        Self::new(|_, _| RecoveryInfo::never())
    }

    /// A classifier that treats every error as transient.
    #[must_use]
    pub fn always() -> Self {
        Self::new(|_, _| RecoveryInfo::retry())
    }

    /// Retries errors for which `predicate` returns `true`.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::new(move |error, _| {
            if predicate(error) {
                RecoveryInfo::retry()
            } else {
                RecoveryInfo::never()
            }
        })
    }

    /// Retries errors whose kind, as extracted by `kind_of`, appears in `allowed`.
    pub fn allow_list<K, F>(kind_of: F, allowed: impl IntoIterator<Item = K>) -> Self
    where
        K: PartialEq + Send + Sync + 'static,
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        let allowed: Vec<K> = allowed.into_iter().collect();
        Self::predicate(move |error| allowed.contains(&kind_of(error)))
    }

    /// Attaches a wait-hint extractor, for example a rate limiter's retry-after.
    ///
    /// When the extractor returns `Some`, the hint replaces any delay reported by the
    /// classification itself.
    #[must_use]
    pub fn with_wait_hint<F>(mut self, hint: F) -> Self
    where
        F: Fn(&E) -> Option<Duration> + Send + Sync + 'static,
    {
        self.wait_hint = Some(WaitHintFn::new(hint));
        self
    }

    /// Classifies the error produced by the given attempt.
    #[must_use]
    pub fn classify(&self, error: &E, attempt: u32) -> RecoveryInfo {
        let recovery = self.classify.call(error, ClassifyArgs { attempt });

        match self.wait_hint.as_ref().and_then(|hint| hint.call(error)) {
            Some(delay) => recovery.delay(delay),
            None => recovery,
        }
    }
}

impl<E: Recovery> Classifier<E> {
    /// Uses the error's own [`Recovery`] implementation.
    #[must_use]
    pub fn recovery() -> Self {
        Self::new(|error: &E, _| error.recovery())
    }
}
