// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Display};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use crate::telemetry::TelemetryHelper;
use crate::{Attempt, ErrorKind, IdempotencyKey};

/// Why an invocation gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ExhaustionReason {
    /// The classifier marked the error as terminal.
    NonRetryable,

    /// A budget refused the next attempt.
    BudgetExhausted,

    /// The invocation was cancelled or hit its deadline.
    Cancelled,

    /// A stopper ended retrying.
    Stopped,
}

impl ExhaustionReason {
    /// Short `snake_case` name, as used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NonRetryable => "non_retryable",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
        }
    }
}

impl Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExhaustionReason> for ErrorKind {
    fn from(reason: ExhaustionReason) -> Self {
        match reason {
            ExhaustionReason::NonRetryable => Self::Permanent,
            ExhaustionReason::BudgetExhausted => Self::BudgetExhausted,
            ExhaustionReason::Cancelled => Self::Cancelled,
            ExhaustionReason::Stopped => Self::Stopped,
        }
    }
}

/// Read-only view of the invocation a hook fires for.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub(crate) operation: &'a str,
    pub(crate) key: Option<&'a IdempotencyKey>,
    pub(crate) attempts: &'a [Attempt],
}

impl<'a> HookContext<'a> {
    /// Name of the retrier running the invocation.
    #[must_use]
    pub fn operation(&self) -> &'a str {
        self.operation
    }

    /// Idempotency key of the invocation, if any.
    #[must_use]
    pub fn key(&self) -> Option<&'a IdempotencyKey> {
        self.key
    }

    /// Attempts finished so far.
    #[must_use]
    pub fn attempts(&self) -> &'a [Attempt] {
        self.attempts
    }
}

/// Observer of an invocation's lifecycle.
///
/// Hooks run synchronously on the invoking task, so they should be quick. A
/// panicking hook is caught and logged; it never affects the invocation.
///
/// Every method has an empty default body.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use rebound::{HookContext, Hooks};
///
/// #[derive(Debug, Default)]
/// struct CountRetries(AtomicU32);
///
/// impl<E> Hooks<E> for CountRetries {
///     fn on_retry_scheduled(&self, _context: &HookContext<'_>, _attempt: u32, _delay: std::time::Duration, _error: &E) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait Hooks<E>: Send + Sync {
    /// Called right before an attempt runs.
    fn on_attempt(&self, _context: &HookContext<'_>, _attempt: u32) {}

    /// Called after a retryable failure, once the next attempt is granted and its delay computed.
    fn on_retry_scheduled(&self, _context: &HookContext<'_>, _attempt: u32, _delay: Duration, _error: &E) {}

    /// Called once when an attempt succeeds.
    fn on_success(&self, _context: &HookContext<'_>, _attempt: u32, _elapsed: Duration) {}

    /// Called once when the invocation gives up.
    fn on_exhausted(&self, _context: &HookContext<'_>, _reason: ExhaustionReason, _error: Option<&E>) {}
}

/// Runs a hook, containing any panic it raises.
pub(crate) fn guarded(telemetry: &TelemetryHelper, hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        telemetry.hook_panicked(hook);
    }
}
