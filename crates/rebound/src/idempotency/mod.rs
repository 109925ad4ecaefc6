// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! At-most-once execution per logical key.
//!
//! An [`IdempotencyStore`] records, for each key, whether an execution is in
//! progress or has finished and with what result. Before running an operation the
//! retrier [claims][IdempotencyStore::claim] the key:
//!
//! - the winner executes and later [completes][IdempotencyStore::complete] the record,
//! - everyone else attaches to the existing record and is answered with its result.
//!
//! Records move `InProgress -> Succeeded | Failed` exactly once. In-progress records
//! carry a lease that the running executor [renews][IdempotencyStore::renew] while
//! it works. A key held by a crashed or abandoned executor can be claimed again
//! once the lease lapses, and terminal records are kept for a TTL to answer
//! duplicate deliveries.
//!
//! [`InMemoryStore`] is the bundled implementation. Durable backends implement the
//! same trait.

mod memory;

use std::borrow::Cow;
use std::fmt::{self, Display};
use std::time::{Duration, SystemTime};

pub use memory::InMemoryStore;

use crate::ErrorKind;

/// Identifies one logical operation, such as a command id or message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(Cow<'static, str>);

impl IdempotencyKey {
    /// Creates a key.
    #[must_use]
    pub fn new(key: impl Into<Cow<'static, str>>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for IdempotencyKey {
    fn from(value: &'static str) -> Self {
        Self(Cow::Borrowed(value))
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The recorded end of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    /// Creates a failure record.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Why the execution stopped.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable summary.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Lifecycle state of a record, with the stored result once terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState<V> {
    /// An executor holds the key.
    InProgress,

    /// The execution produced a value.
    Succeeded(V),

    /// The execution ended with an error.
    Failed(Failure),
}

/// [`RecordState`] without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    /// An executor holds the key.
    InProgress,

    /// The execution produced a value.
    Succeeded,

    /// The execution ended with an error.
    Failed,
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// The store's view of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord<V> {
    key: IdempotencyKey,
    state: RecordState<V>,
    created_at: SystemTime,
    expires_at: SystemTime,
}

impl<V> IdempotencyRecord<V> {
    /// Creates a record. Used by store implementations.
    #[must_use]
    pub fn new(key: IdempotencyKey, state: RecordState<V>, created_at: SystemTime, expires_at: SystemTime) -> Self {
        Self {
            key,
            state,
            created_at,
            expires_at,
        }
    }

    /// The key this record belongs to.
    #[must_use]
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> &RecordState<V> {
        &self.state
    }

    /// Consumes the record and returns its state.
    #[must_use]
    pub fn into_state(self) -> RecordState<V> {
        self.state
    }

    /// The current status.
    #[must_use]
    pub fn status(&self) -> RecordStatus {
        match self.state {
            RecordState::InProgress => RecordStatus::InProgress,
            RecordState::Succeeded(_) => RecordStatus::Succeeded,
            RecordState::Failed(_) => RecordStatus::Failed,
        }
    }

    /// When the key was claimed.
    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// When an in-progress lease lapses or a terminal record is dropped.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Whether the record has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn extend(&mut self, expires_at: SystemTime) {
        self.expires_at = expires_at;
    }

    pub(crate) fn set_state(&mut self, state: RecordState<V>, expires_at: SystemTime) {
        self.state = state;
        self.expires_at = expires_at;
    }
}

/// Proof that the holder won a claim, needed to complete the record.
///
/// Each claim, including a reclaim after a lapsed lease, gets a distinct token,
/// so an executor whose lease was taken over cannot complete the new holder's record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lease {
    key: IdempotencyKey,
    token: u64,
}

impl Lease {
    /// Creates a lease. Used by store implementations.
    #[must_use]
    pub fn new(key: IdempotencyKey, token: u64) -> Self {
        Self { key, token }
    }

    /// The claimed key.
    #[must_use]
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// The claim generation.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Result of [`IdempotencyStore::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim<V> {
    /// The caller now holds the key and must execute, then complete.
    Won(Lease),

    /// Someone else holds or already finished the key.
    Lost(IdempotencyRecord<V>),
}

/// The terminal transition reported to [`IdempotencyStore::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<V> {
    /// The execution produced a value.
    Succeeded(V),

    /// The execution ended with an error.
    Failed(Failure),
}

impl<V> From<Completion<V>> for RecordState<V> {
    fn from(value: Completion<V>) -> Self {
        match value {
            Completion::Succeeded(value) => Self::Succeeded(value),
            Completion::Failed(failure) => Self::Failed(failure),
        }
    }
}

/// Errors reported by an [`IdempotencyStore`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// There is no record for the key.
    #[error("no idempotency record for key '{key}'")]
    NotFound {
        /// The key.
        key: IdempotencyKey,
    },

    /// The record is not in progress, for example because it was already completed.
    #[error("idempotency record for key '{key}' is {status}, expected in_progress")]
    InvalidTransition {
        /// The key.
        key: IdempotencyKey,
        /// The status found.
        status: RecordStatus,
    },

    /// The lease was superseded by a later claim.
    #[error("lease on idempotency key '{key}' was superseded by a later claim")]
    StaleLease {
        /// The key.
        key: IdempotencyKey,
    },

    /// The backing storage failed.
    #[error("idempotency store backend failed")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Storage for idempotency records.
///
/// Implementations must make [`claim`][Self::claim] atomic per key: when several
/// callers claim the same absent key concurrently, exactly one receives
/// [`Claim::Won`].
pub trait IdempotencyStore<V>: Send + Sync {
    /// Claims `key`, or returns the record that prevents the claim.
    ///
    /// An in-progress record whose lease has lapsed, or a terminal record past its
    /// TTL, is replaced and the caller wins. A won claim stays valid for `lease`.
    fn claim(&self, key: &IdempotencyKey, lease: Duration) -> impl Future<Output = Result<Claim<V>, StoreError>> + Send;

    /// Moves the leased record to its terminal state and keeps it for `ttl`.
    ///
    /// # Errors
    ///
    /// Fails when the record is missing, no longer in progress, or was reclaimed
    /// under a different lease.
    fn complete(&self, lease: &Lease, completion: Completion<V>, ttl: Duration) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Extends the leased in-progress record so it stays valid for another `lease`.
    ///
    /// A live holder calls this periodically; only a holder that stops renewing
    /// loses the key to another caller.
    ///
    /// # Errors
    ///
    /// Fails when the record is missing, no longer in progress, or was reclaimed
    /// under a different lease.
    fn renew(&self, lease: &Lease, lease_for: Duration) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns the live record for `key`, if any.
    fn get(&self, key: &IdempotencyKey) -> impl Future<Output = Result<Option<IdempotencyRecord<V>>, StoreError>> + Send;

    /// Waits until the record for `key` is terminal and returns it.
    ///
    /// Resolves to `None` when the record disappears or its lease lapses first; the
    /// caller should then claim again.
    fn wait(&self, key: &IdempotencyKey) -> impl Future<Output = Result<Option<IdempotencyRecord<V>>, StoreError>> + Send;

    /// Removes the record for `key` regardless of its state. Returns whether one existed.
    fn expire(&self, key: &IdempotencyKey) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_conversions() {
        let borrowed = IdempotencyKey::from("order-1");
        let owned = IdempotencyKey::from(String::from("order-1"));

        assert_eq!(borrowed, owned);
        assert_eq!(borrowed.as_str(), "order-1");
        assert_eq!(IdempotencyKey::new("order-1").to_string(), "order-1");
    }

    #[test]
    fn record_status_follows_state() {
        let now = SystemTime::UNIX_EPOCH;
        let later = now + Duration::from_secs(10);

        let mut record = IdempotencyRecord::new(IdempotencyKey::from("k"), RecordState::InProgress, now, later);
        assert_eq!(record.status(), RecordStatus::InProgress);
        assert!(!record.is_expired(now));
        assert!(record.is_expired(later));

        record.extend(later + Duration::from_secs(5));
        assert!(!record.is_expired(later));

        record.set_state(RecordState::Succeeded(5), later + Duration::from_secs(1));
        assert_eq!(record.status(), RecordStatus::Succeeded);
        assert_eq!(record.expires_at(), later + Duration::from_secs(1));
        assert_eq!(record.created_at(), now);
        assert_eq!(record.into_state(), RecordState::Succeeded(5));
    }

    #[test]
    fn completion_into_state() {
        let failure = Failure::new(ErrorKind::Permanent, "bad input");

        assert_eq!(RecordState::from(Completion::Succeeded(1)), RecordState::Succeeded(1));
        assert_eq!(RecordState::<u32>::from(Completion::Failed(failure.clone())), RecordState::Failed(failure));
    }

    #[test]
    fn store_error_messages() {
        let error = StoreError::InvalidTransition {
            key: IdempotencyKey::from("k"),
            status: RecordStatus::Succeeded,
        };
        assert_eq!(error.to_string(), "idempotency record for key 'k' is succeeded, expected in_progress");

        let lease = Lease::new(IdempotencyKey::from("k"), 7);
        assert_eq!(lease.token(), 7);
        assert_eq!(lease.key().as_str(), "k");
    }
}
