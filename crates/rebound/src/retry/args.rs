// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::IdempotencyKey;

/// What the operation is told about the attempt it runs for.
///
/// The cancellation token fires when the invocation is cancelled or reaches its
/// deadline. Long-running operations can watch it to stop early; the executor stops
/// polling the operation either way.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub(super) attempt: u32,
    pub(super) key: Option<IdempotencyKey>,
    pub(super) cancellation: CancellationToken,
}

impl OperationContext {
    /// The 1-based attempt index.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The idempotency key of the invocation, if any.
    #[must_use]
    pub fn key(&self) -> Option<&IdempotencyKey> {
        self.key.as_ref()
    }

    /// Token cancelled when the invocation is abandoned.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Shortcut for `self.cancellation().is_cancelled()`.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Arguments for the error factory passed to
/// [`attempt_timeout`][super::RetryBuilder::attempt_timeout].
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct TimeoutArgs {
    pub(super) attempt: u32,
    pub(super) timeout: Duration,
}

impl TimeoutArgs {
    /// The 1-based index of the attempt that timed out.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The configured per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
