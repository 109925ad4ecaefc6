// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, SystemTime};

use recoverable::RecoveryInfo;

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttemptOutcome {
    /// The operation returned a value.
    Succeeded,

    /// The operation returned an error, classified as shown.
    Failed(RecoveryInfo),

    /// The attempt was interrupted by cancellation or the invocation deadline.
    Cancelled,
}

/// A record of one execution of the operation.
///
/// Attempts are appended to the invocation's history as they finish and are never
/// modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    index: u32,
    started_at: SystemTime,
    ended_at: SystemTime,
    outcome: AttemptOutcome,
    delay: Option<Duration>,
}

impl Attempt {
    pub(crate) fn new(index: u32, started_at: SystemTime, ended_at: SystemTime, outcome: AttemptOutcome, delay: Option<Duration>) -> Self {
        Self {
            index,
            started_at,
            ended_at,
            outcome,
            delay,
        }
    }

    /// The 1-based position of this attempt within its invocation.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// When the operation was called.
    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// When the operation returned or was interrupted.
    #[must_use]
    pub fn ended_at(&self) -> SystemTime {
        self.ended_at
    }

    /// Time spent inside the operation.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.ended_at.duration_since(self.started_at).unwrap_or_default()
    }

    /// How the attempt ended.
    #[must_use]
    pub fn outcome(&self) -> &AttemptOutcome {
        &self.outcome
    }

    /// The wait scheduled before the next attempt; `None` for the final attempt.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Whether the operation returned a value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }
}

/// Upper bound on the number of attempts of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaxAttempts {
    /// At most this many attempts, including the first.
    Finite(u32),

    /// No per-invocation cap. Budgets and cancellation still apply.
    Infinite,
}

impl MaxAttempts {
    pub(crate) fn limit(self) -> Option<u32> {
        match self {
            Self::Finite(max) => Some(max),
            Self::Infinite => None,
        }
    }
}

impl From<u32> for MaxAttempts {
    fn from(value: u32) -> Self {
        Self::Finite(value)
    }
}

impl PartialEq<u32> for MaxAttempts {
    fn eq(&self, other: &u32) -> bool {
        matches!(self, Self::Finite(max) if max == other)
    }
}
