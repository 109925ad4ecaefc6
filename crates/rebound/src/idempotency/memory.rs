// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_channel::oneshot;
use futures_util::future::{Either, select};
use tick::Clock;

use super::{Claim, Completion, IdempotencyKey, IdempotencyRecord, IdempotencyStore, Lease, RecordState, RecordStatus, StoreError};

/// Fallback horizon for expiry times that would overflow [`SystemTime`].
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Process-local [`IdempotencyStore`] backed by a sharded concurrent map.
///
/// Claims on the same key serialize on that key's shard only; unrelated keys never
/// contend on a global lock. Callers waiting on an in-progress key are parked on a
/// one-shot channel and woken by the completion, without polling.
///
/// Expired records are ignored by every operation and physically removed either
/// when reclaimed or by [`sweep`][Self::sweep].
///
/// # Examples
///
/// ```
/// # futures::executor::block_on(async {
/// use std::time::Duration;
///
/// use rebound::{Claim, Completion, IdempotencyKey, IdempotencyStore, InMemoryStore};
/// use tick::Clock;
///
/// let store = InMemoryStore::<u32>::new(&Clock::new_frozen());
/// let key = IdempotencyKey::from("order-42");
///
/// let Claim::Won(lease) = store.claim(&key, Duration::from_secs(30)).await? else {
///     unreachable!("the key is fresh");
/// };
/// store.complete(&lease, Completion::Succeeded(7), Duration::from_secs(60)).await?;
///
/// assert!(matches!(store.claim(&key, Duration::from_secs(30)).await?, Claim::Lost(_)));
/// # Ok::<(), rebound::StoreError>(())
/// # }).unwrap();
/// ```
pub struct InMemoryStore<V> {
    clock: Clock,
    slots: DashMap<IdempotencyKey, Slot<V>>,
    next_token: AtomicU64,
}

struct Slot<V> {
    record: IdempotencyRecord<V>,
    token: u64,
    waiters: Vec<oneshot::Sender<IdempotencyRecord<V>>>,
}

impl<V> std::fmt::Debug for InMemoryStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").field("len", &self.slots.len()).finish_non_exhaustive()
    }
}

impl<V> InMemoryStore<V> {
    /// Creates an empty store that reads time from `clock`.
    #[must_use]
    pub fn new(clock: &Clock) -> Self {
        Self {
            clock: clock.clone(),
            slots: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Removes every expired record and returns how many were removed.
    ///
    /// Callers waiting on a removed in-progress record are released and will
    /// claim the key again.
    pub fn sweep(&self) -> usize {
        let now = self.clock.system_time();
        let mut removed = 0;

        self.slots.retain(|_, slot| {
            let keep = !slot.record.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Number of records held, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn expiry(now: SystemTime, after: Duration) -> SystemTime {
        now.checked_add(after)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }
}

impl<V> IdempotencyStore<V> for InMemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn claim(&self, key: &IdempotencyKey, lease: Duration) -> Result<Claim<V>, StoreError> {
        let now = self.clock.system_time();
        let expires_at = Self::expiry(now, lease);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let claim = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();

                if slot.record.is_expired(now) {
                    // waiters of a lapsed holder now wait on the new one
                    slot.token = token;
                    slot.record = IdempotencyRecord::new(key.clone(), RecordState::InProgress, now, expires_at);
                    Claim::Won(Lease::new(key.clone(), token))
                } else {
                    Claim::Lost(slot.record.clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    record: IdempotencyRecord::new(key.clone(), RecordState::InProgress, now, expires_at),
                    token,
                    waiters: Vec::new(),
                });
                Claim::Won(Lease::new(key.clone(), token))
            }
        };

        Ok(claim)
    }

    async fn complete(&self, lease: &Lease, completion: Completion<V>, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.system_time();

        let (record, waiters) = {
            let Some(mut slot) = self.slots.get_mut(lease.key()) else {
                return Err(StoreError::NotFound { key: lease.key().clone() });
            };

            if slot.token != lease.token() {
                return Err(StoreError::StaleLease { key: lease.key().clone() });
            }

            let status = slot.record.status();
            if status != RecordStatus::InProgress {
                return Err(StoreError::InvalidTransition {
                    key: lease.key().clone(),
                    status,
                });
            }

            slot.record.set_state(completion.into(), Self::expiry(now, ttl));
            (slot.record.clone(), std::mem::take(&mut slot.waiters))
        };

        for waiter in waiters {
            // the waiter may have been cancelled
            _ = waiter.send(record.clone());
        }

        Ok(())
    }

    async fn renew(&self, lease: &Lease, lease_for: Duration) -> Result<(), StoreError> {
        let now = self.clock.system_time();

        let Some(mut slot) = self.slots.get_mut(lease.key()) else {
            return Err(StoreError::NotFound { key: lease.key().clone() });
        };

        if slot.token != lease.token() {
            return Err(StoreError::StaleLease { key: lease.key().clone() });
        }

        let status = slot.record.status();
        if status != RecordStatus::InProgress {
            return Err(StoreError::InvalidTransition {
                key: lease.key().clone(),
                status,
            });
        }

        slot.record.extend(Self::expiry(now, lease_for));
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord<V>>, StoreError> {
        let now = self.clock.system_time();

        Ok(self
            .slots
            .get(key)
            .filter(|slot| !slot.record.is_expired(now))
            .map(|slot| slot.record.clone()))
    }

    async fn wait(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord<V>>, StoreError> {
        let now = self.clock.system_time();

        let (receiver, lease_left) = {
            let Some(mut slot) = self.slots.get_mut(key) else {
                return Ok(None);
            };

            if slot.record.is_expired(now) {
                return Ok(None);
            }

            if slot.record.status() != RecordStatus::InProgress {
                return Ok(Some(slot.record.clone()));
            }

            // waiters whose lapse timer fired are gone
            slot.waiters.retain(|waiter| !waiter.is_canceled());

            let (sender, receiver) = oneshot::channel();
            slot.waiters.push(sender);
            (receiver, slot.record.expires_at().duration_since(now).unwrap_or_default())
        };

        let lapse = pin!(self.clock.delay(lease_left));

        match select(receiver, lapse).await {
            Either::Left((Ok(record), _)) => Ok(Some(record)),
            Either::Left((Err(oneshot::Canceled), _)) | Either::Right(_) => Ok(None),
        }
    }

    async fn expire(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        Ok(self.slots.remove(key).is_some())
    }
}
