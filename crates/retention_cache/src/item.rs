// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference-counted cache entries with deferred eviction.

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::builder::Retention;
use crate::cache::Shared;
use crate::emitter::Subscription;
use crate::key::CacheKey;

/// One cached resource together with its observer count.
///
/// An item is live from the moment its cache constructs it until it is evicted. While live, every
/// [`Lease`] obtained through [`subscribe`](Self::subscribe) keeps it in the cache. When the last
/// lease is released the item is either evicted right away or, with a grace period configured,
/// after that period elapses without a new subscription.
///
/// Cloning an item is cheap and does not count as an observation.
pub struct RetentionItem<V> {
    inner: Arc<ItemInner<V>>,
}

struct ItemInner<V> {
    key: CacheKey,
    value: V,
    state: Mutex<ItemState>,
    owner: Weak<Shared<V>>,
}

#[derive(Debug, Default)]
struct ItemState {
    ref_count: usize,
    // bumped on every arm and cancel so a timer that already woke can tell it is stale
    generation: u64,
    timer: Option<AbortHandle>,
    destroyed: bool,
}

impl ItemState {
    fn cancel_timer(&mut self) -> bool {
        self.generation += 1;
        self.timer.take().is_some_and(|timer| {
            timer.abort();
            true
        })
    }
}

impl<V> RetentionItem<V> {
    pub(crate) fn new(key: CacheKey, value: V, owner: Weak<Shared<V>>) -> Self {
        Self {
            inner: Arc::new(ItemInner {
                key,
                value,
                state: Mutex::new(ItemState::default()),
                owner,
            }),
        }
    }

    /// Returns the cached resource.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.inner.value
    }

    /// Returns the key this item is cached under.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    /// Returns the number of outstanding leases.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().ref_count
    }

    /// Returns `true` until the item has been evicted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.inner.state.lock().destroyed
    }

    /// Returns `true` while a grace timer is armed.
    #[must_use]
    pub fn has_pending_cleanup(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// Marks the item destroyed. Returns `false` if it already was.
    pub(crate) fn mark_destroyed(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return false;
        }
        state.destroyed = true;
        state.cancel_timer();
        true
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<V> RetentionItem<V>
where
    V: Send + Sync + 'static,
{
    /// Registers an observer and returns the lease that releases it.
    ///
    /// A pending grace timer is cancelled. Subscribing to an item that was already evicted keeps
    /// its value readable but does not put it back into the cache.
    pub fn subscribe(&self) -> Lease<V> {
        let mut state = self.inner.state.lock();
        state.ref_count += 1;
        if state.cancel_timer() {
            tracing::trace!(cache.key = %self.inner.key, "cache.timer_cancelled");
        }
        drop(state);

        Lease::new(self.clone())
    }

    /// Subscribes only if the item is still live.
    pub(crate) fn try_subscribe(&self) -> Option<Lease<V>> {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return None;
        }

        state.ref_count += 1;
        let resumed = state.cancel_timer();
        drop(state);

        if resumed {
            tracing::debug!(cache.key = %self.inner.key, "cache.resumed");
        }
        Some(Lease::new(self.clone()))
    }

    /// Starts the countdown for an item created without observers.
    pub(crate) fn start_idle(&self, retention: Retention) {
        if let Retention::Grace(grace) = retention {
            let generation = {
                let mut state = self.inner.state.lock();
                if state.ref_count > 0 || state.destroyed {
                    return;
                }
                state.cancel_timer();
                state.generation
            };
            self.arm(grace, generation);
        }
    }

    fn release(&self) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.ref_count = state.ref_count.saturating_sub(1);
            if state.ref_count > 0 || state.destroyed {
                return;
            }
            state.cancel_timer();
            state.generation
        };

        let Some(owner) = self.inner.owner.upgrade() else {
            return;
        };

        match owner.retention() {
            Retention::Immediate => self.expire(generation),
            Retention::Grace(grace) => self.arm(grace, generation),
        }
    }

    fn arm(&self, grace: Duration, generation: u64) {
        let Some(owner) = self.inner.owner.upgrade() else {
            return;
        };

        let clock = owner.runtime().clock().clone();
        let deadline = clock.instant().checked_add(grace);

        let item = self.clone();
        let spawned = owner.runtime().spawn(async move {
            match deadline {
                Some(deadline) => clock.delay(deadline.saturating_duration_since(clock.instant())).await,
                // beyond the clock's range: stays armed until cancelled, never expires
                None => std::future::pending().await,
            }
            item.expire(generation);
        });

        let Some(timer) = spawned else {
            tracing::warn!(
                cache.name = owner.name(),
                cache.key = %self.inner.key,
                "no tokio runtime to schedule the grace timer, evicting immediately"
            );
            self.expire(generation);
            return;
        };

        let mut state = self.inner.state.lock();
        if state.generation == generation && !state.destroyed {
            state.timer = Some(timer);
            drop(state);
            tracing::trace!(
                cache.name = owner.name(),
                cache.key = %self.inner.key,
                cache.grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "cache.timer_armed"
            );
        } else {
            timer.abort();
        }
    }

    fn expire(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed || state.ref_count > 0 || state.generation != generation {
                return;
            }
            state.destroyed = true;
            state.timer = None;
        }

        if let Some(owner) = self.inner.owner.upgrade() {
            owner.evict(self);
        }
    }
}

impl<V> Clone for RetentionItem<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Debug> Debug for RetentionItem<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RetentionItem")
            .field("key", &self.inner.key)
            .field("value", &self.inner.value)
            .field("ref_count", &state.ref_count)
            .field("pending_cleanup", &state.timer.is_some())
            .field("live", &!state.destroyed)
            .finish()
    }
}

/// An observation of a [`RetentionItem`].
///
/// Holding a lease keeps the item in its cache. The lease is released exactly once, either by
/// [`release`](Self::release) or by dropping it.
///
/// Dereferences to the cached value.
#[must_use = "dropping a lease releases it immediately"]
pub struct Lease<V>
where
    V: Send + Sync + 'static,
{
    item: RetentionItem<V>,
    released: bool,
}

impl<V> Lease<V>
where
    V: Send + Sync + 'static,
{
    fn new(item: RetentionItem<V>) -> Self {
        Self { item, released: false }
    }

    /// Returns the leased item.
    #[must_use]
    pub fn item(&self) -> &RetentionItem<V> {
        &self.item
    }

    /// Releases the lease now.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if !self.released {
            self.released = true;
            self.item.release();
        }
    }
}

impl<V> Deref for Lease<V>
where
    V: Send + Sync + 'static,
{
    type Target = V;

    fn deref(&self) -> &V {
        self.item().value()
    }
}

impl<V> Drop for Lease<V>
where
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.release_now();
    }
}

impl<V> Debug for Lease<V>
where
    V: Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("item", &self.item).finish()
    }
}

impl<V> From<Lease<V>> for Subscription
where
    V: Send + Sync + 'static,
{
    fn from(lease: Lease<V>) -> Self {
        Self::new(move || lease.release())
    }
}
