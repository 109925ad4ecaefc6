// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::{Attempt, RetryError};

/// The result of one invocation together with its attempt history.
#[derive(Debug)]
pub struct Execution<T, E> {
    pub(super) outcome: Result<T, RetryError<E>>,
    pub(super) attempts: Vec<Attempt>,
    pub(super) replayed: bool,
    pub(super) elapsed: Duration,
}

impl<T, E> Execution<T, E> {
    /// The value, or the terminal error.
    #[must_use]
    pub fn outcome(&self) -> &Result<T, RetryError<E>> {
        &self.outcome
    }

    /// Consumes the execution and returns the value or terminal error.
    ///
    /// # Errors
    ///
    /// Returns the [`RetryError`] the invocation ended with.
    pub fn into_result(self) -> Result<T, RetryError<E>> {
        self.outcome
    }

    /// Whether the invocation produced a value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Every attempt this invocation ran, in order.
    ///
    /// Empty for replayed results and for invocations stopped before their first attempt.
    #[must_use]
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// Number of attempts this invocation ran.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Whether the result was answered from the idempotency store.
    #[must_use]
    pub fn is_replayed(&self) -> bool {
        self.replayed
    }

    /// Wall-clock time from the start of the invocation to its end.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Splits the execution into its result and attempt history.
    #[must_use]
    pub fn into_parts(self) -> (Result<T, RetryError<E>>, Vec<Attempt>) {
        (self.outcome, self.attempts)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::{AttemptOutcome, ErrorKind};

    #[test]
    fn accessors() {
        let attempt = Attempt::new(1, SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH, AttemptOutcome::Succeeded, None);
        let execution = Execution::<u32, String> {
            outcome: Ok(7),
            attempts: vec![attempt],
            replayed: false,
            elapsed: Duration::from_millis(3),
        };

        assert!(execution.is_success());
        assert!(!execution.is_replayed());
        assert_eq!(execution.attempt_count(), 1);
        assert_eq!(execution.elapsed(), Duration::from_millis(3));
        assert_eq!(execution.outcome().as_ref().ok(), Some(&7));

        let (result, attempts) = execution.into_parts();
        assert_eq!(result.ok(), Some(7));
        assert_eq!(attempts.len(), 1);
    }

    #[test]
    fn failed_execution() {
        let execution = Execution::<u32, String> {
            outcome: Err(RetryError::new(ErrorKind::Cancelled, 0, None)),
            attempts: Vec::new(),
            replayed: false,
            elapsed: Duration::ZERO,
        };

        assert!(!execution.is_success());
        assert_eq!(execution.into_result().unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
