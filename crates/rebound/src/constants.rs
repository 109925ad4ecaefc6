// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::backoff::{Backoff, Jitter};

/// Default backoff kind: exponential.
///
/// Exponential growth sheds load quickly while a dependency is struggling and pairs
/// well with jitter.
pub(crate) const DEFAULT_BACKOFF: Backoff = Backoff::Exponential;

/// Base delay for the first retry.
pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

/// Upper bound for any computed backoff delay.
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Growth factor for exponential backoff.
pub(crate) const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Full jitter desynchronizes callers that failed at the same moment.
///
/// See [Exponential Backoff and Jitter](https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter).
pub(crate) const DEFAULT_JITTER: Jitter = Jitter::Full;

/// Share of the computed delay that jitter may remove.
pub(crate) const DEFAULT_JITTER_RATIO: f64 = 1.0;

/// Default cap on the total number of attempts of a single invocation: the first
/// attempt plus three retries.
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// How long a terminal idempotency record answers duplicate deliveries.
pub(crate) const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(60 * 60);

/// How long an in-progress claim stays valid before another caller may reclaim it.
pub(crate) const DEFAULT_IDEMPOTENCY_LEASE: Duration = Duration::from_secs(60);

pub(crate) const ERR_POISONED_LOCK: &str =
    "poisoned lock - cannot continue execution because security and privacy guarantees can no longer be upheld";
