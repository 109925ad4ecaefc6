// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, SystemTime};

use tick::Clock;
use tick::fmt::Rfc2822;

use crate::Classifier;

/// Reads the value of an HTTP `Retry-After` header as a wait hint.
///
/// Both forms of the header are understood:
///
/// - delta-seconds, such as `120`,
/// - an HTTP date, such as `Wed, 21 Oct 2015 07:28:00 GMT`, measured from `now`.
///
/// A date in the past yields a zero wait. Empty or malformed values yield `None`.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// use rebound::parse_retry_after;
///
/// let now = SystemTime::UNIX_EPOCH;
///
/// assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("Thu, 01 Jan 1970 00:01:00 GMT", now), Some(Duration::from_secs(60)));
/// assert_eq!(parse_retry_after("soon", now), None);
/// ```
#[must_use]
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = SystemTime::from(value.parse::<Rfc2822>().ok()?);
    Some(at.duration_since(now).unwrap_or_default())
}

impl<E> Classifier<E> {
    /// Uses the `Retry-After` header carried by an error as its wait hint.
    ///
    /// `header` returns the raw header value, if the error has one. Dates are
    /// measured from the `clock`'s current time when the error is classified.
    #[must_use]
    pub fn with_retry_after<F>(self, clock: &Clock, header: F) -> Self
    where
        F: Fn(&E) -> Option<&str> + Send + Sync + 'static,
    {
        let clock = clock.clone();
        self.with_wait_hint(move |error| header(error).and_then(|value| parse_retry_after(value, clock.system_time())))
    }
}
