// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Display};

use crate::idempotency::{Failure, StoreError};

/// Why an invocation ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The classifier marked the last error as not worth retrying.
    Permanent,

    /// A budget refused the next attempt, or the attempt cap was reached.
    BudgetExhausted,

    /// The caller cancelled the invocation or its deadline passed.
    Cancelled,

    /// A [`Stopper`][crate::Stopper] ended retrying, for example under backpressure.
    Stopped,

    /// The idempotency key is being executed elsewhere and the retrier is set to fail fast.
    IdempotencyConflict,

    /// The idempotency store could not be reached or rejected a transition.
    Store,
}

impl ErrorKind {
    /// Short `snake_case` name, as used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::Store => "store",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error of an invocation.
///
/// Wraps the last error returned by the operation, when there was one, together
/// with the reason retrying stopped.
#[derive(Debug)]
pub struct RetryError<E> {
    kind: ErrorKind,
    attempts: u32,
    last_error: Option<E>,
    store_error: Option<StoreError>,
    replayed: Option<Failure>,
}

impl<E> RetryError<E> {
    pub(crate) fn new(kind: ErrorKind, attempts: u32, last_error: Option<E>) -> Self {
        Self {
            kind,
            attempts,
            last_error,
            store_error: None,
            replayed: None,
        }
    }

    pub(crate) fn store(error: StoreError, attempts: u32) -> Self {
        Self {
            store_error: Some(error),
            ..Self::new(ErrorKind::Store, attempts, None)
        }
    }

    pub(crate) fn replayed(failure: Failure) -> Self {
        let kind = failure.kind();
        Self {
            replayed: Some(failure),
            ..Self::new(kind, 0, None)
        }
    }

    /// Why the invocation stopped.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Number of attempts this invocation executed.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The error returned by the final attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        self.last_error.as_ref()
    }

    /// Consumes the error and returns the final operation error.
    #[must_use]
    pub fn into_last_error(self) -> Option<E> {
        self.last_error
    }

    /// The store failure behind an [`ErrorKind::Store`] error.
    #[must_use]
    pub fn store_error(&self) -> Option<&StoreError> {
        self.store_error.as_ref()
    }

    /// The recorded failure of an earlier execution of the same idempotency key.
    ///
    /// `Some` means this invocation did not run the operation at all.
    #[must_use]
    pub fn replayed_failure(&self) -> Option<&Failure> {
        self.replayed.as_ref()
    }

    /// Whether this error was answered from the idempotency store.
    #[must_use]
    pub fn is_replayed(&self) -> bool {
        self.replayed.is_some()
    }
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(failure) = &self.replayed {
            return write!(f, "{} (replayed): {}", self.kind, failure.message());
        }

        if let Some(error) = &self.store_error {
            return write!(f, "{}: {error}", self.kind);
        }

        write!(f, "{} after {} attempt(s)", self.kind, self.attempts)?;

        match &self.last_error {
            Some(error) => write!(f, ": {error}"),
            None => Ok(()),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Some(error) = &self.last_error {
            return Some(error);
        }

        self.store_error.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
