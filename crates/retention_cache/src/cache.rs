// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The keyed retention cache.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tick::Clock;

use crate::builder::{Retention, RetentionCacheBuilder};
use crate::error::EncodeError;
use crate::item::{Lease, RetentionItem};
use crate::key::{CacheKey, encode_key};
use crate::runtime::Runtime;

pub(crate) type Generator<P, V> = Arc<dyn Fn(&P) -> V + Send + Sync>;
pub(crate) type KeyFn<P> = Arc<dyn Fn(&P) -> Result<CacheKey, EncodeError> + Send + Sync>;
pub(crate) type Cleanup<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// A keyed cache of shared resources that are torn down once nobody observes them.
///
/// Each parameter value is canonicalized into a [`CacheKey`]. The first lookup for a key runs the
/// generator; later lookups return the same [`RetentionItem`] for as long as it stays live.
/// Observers hold a [`Lease`]. After the last lease is released the entry is evicted, either
/// immediately or once the configured grace period passes without a new lease, and the
/// configured cleanup function runs on the resource.
///
/// The generator runs while the cache is locked and must not call back into the same cache.
///
/// Cloning a cache is cheap; clones share entries.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use retention_cache::RetentionCache;
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), retention_cache::EncodeError> {
/// let cache = RetentionCache::builder(Clock::new_tokio(), |path: &String| path.to_uppercase())
///     .retention(Duration::from_millis(500))
///     .build();
///
/// let lease = cache.subscribe(&"users/ada".to_owned())?;
/// assert_eq!(*lease, "USERS/ADA");
///
/// // The entry survives the release for the grace period.
/// lease.release();
/// assert!(cache.contains(&"users/ada".to_owned())?);
/// # Ok(())
/// # }
/// ```
pub struct RetentionCache<P: ?Sized, V> {
    shared: Arc<Shared<V>>,
    generator: Generator<P, V>,
    key_fn: KeyFn<P>,
}

pub(crate) struct Shared<V> {
    name: Cow<'static, str>,
    retention: Retention,
    runtime: Runtime,
    cleanup: Option<Cleanup<V>>,
    entries: Mutex<HashMap<CacheKey, RetentionItem<V>>>,
}

impl<P, V> RetentionCache<P, V>
where
    P: Serialize + ?Sized + 'static,
    V: Send + Sync + 'static,
{
    /// Starts building a cache whose keys are encoded from the parameter itself.
    #[must_use]
    pub fn builder(clock: Clock, generator: impl Fn(&P) -> V + Send + Sync + 'static) -> RetentionCacheBuilder<P, V> {
        RetentionCacheBuilder::new(clock, Arc::new(generator), Arc::new(|param: &P| encode_key(param)))
    }
}

impl<P, V> RetentionCache<P, V>
where
    P: ?Sized + 'static,
    V: Send + Sync + 'static,
{
    /// Starts building a cache whose keys are encoded from `key_serializer(param)`.
    ///
    /// The parameter type itself need not be serializable.
    #[must_use]
    pub fn builder_with_key<K, F>(
        clock: Clock,
        generator: impl Fn(&P) -> V + Send + Sync + 'static,
        key_serializer: F,
    ) -> RetentionCacheBuilder<P, V>
    where
        K: Serialize,
        F: Fn(&P) -> K + Send + Sync + 'static,
    {
        RetentionCacheBuilder::new(
            clock,
            Arc::new(generator),
            Arc::new(move |param: &P| encode_key(&key_serializer(param))),
        )
    }

    pub(crate) fn from_parts(
        name: Cow<'static, str>,
        retention: Retention,
        runtime: Runtime,
        cleanup: Option<Cleanup<V>>,
        generator: Generator<P, V>,
        key_fn: KeyFn<P>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                retention,
                runtime,
                cleanup,
                entries: Mutex::new(HashMap::new()),
            }),
            generator,
            key_fn,
        }
    }

    /// Returns the item cached for `param`, constructing it on a miss.
    ///
    /// A lookup never counts as an observation. A new item starts its grace period right away;
    /// with [`Retention::Immediate`] a new item is constructed and torn down before this returns
    /// and is reported as no longer live. Use [`subscribe`](Self::subscribe) to look up and
    /// observe in one step.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if `param` has no canonical key encoding.
    pub fn get_item(&self, param: &P) -> Result<RetentionItem<V>, EncodeError> {
        let key = (self.key_fn)(param)?;

        let item = {
            let mut entries = self.shared.entries.lock();
            if let Some(item) = entries.get(&key).filter(|item| item.is_live()) {
                return Ok(item.clone());
            }

            let item = RetentionItem::new(key.clone(), (self.generator)(param), Arc::downgrade(&self.shared));
            tracing::debug!(cache.name = %self.shared.name, cache.key = %key, "cache.created");

            if self.shared.retention == Retention::Immediate {
                item.mark_destroyed();
                // drop a destroyed predecessor, if any, so the key is not left dangling
                entries.remove(&key);
                drop(entries);
                self.shared.teardown(&item);
                return Ok(item);
            }

            entries.insert(key, item.clone());
            item
        };

        item.start_idle(self.shared.retention);
        Ok(item)
    }

    /// Looks up or constructs the item for `param` and observes it.
    ///
    /// Lookup and observation happen atomically, so a concurrent eviction cannot slip in
    /// between them.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if `param` has no canonical key encoding.
    pub fn subscribe(&self, param: &P) -> Result<Lease<V>, EncodeError> {
        let key = (self.key_fn)(param)?;
        let mut entries = self.shared.entries.lock();

        if let Some(lease) = entries.get(&key).and_then(RetentionItem::try_subscribe) {
            return Ok(lease);
        }

        let item = RetentionItem::new(key.clone(), (self.generator)(param), Arc::downgrade(&self.shared));
        tracing::debug!(cache.name = %self.shared.name, cache.key = %key, "cache.created");
        let lease = item.subscribe();
        let previous = entries.insert(key, item);
        drop(entries);
        drop(previous);
        Ok(lease)
    }

    /// Returns the key `param` is cached under.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if `param` has no canonical key encoding.
    pub fn key_for(&self, param: &P) -> Result<CacheKey, EncodeError> {
        (self.key_fn)(param)
    }

    /// Returns `true` if a live entry exists for `param`.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if `param` has no canonical key encoding.
    pub fn contains(&self, param: &P) -> Result<bool, EncodeError> {
        let key = (self.key_fn)(param)?;
        Ok(self.shared.entries.lock().get(&key).is_some_and(RetentionItem::is_live))
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.lock().values().filter(|item| item.is_live()).count()
    }

    /// Returns `true` if the cache holds no live entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cache name used in log events.
    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Returns the configured retention.
    #[must_use]
    pub fn retention(&self) -> Retention {
        self.shared.retention
    }

    /// Evicts every entry now.
    ///
    /// Pending grace timers are cancelled and every resource is torn down, including ones that
    /// are still leased. Outstanding leases keep their value readable and releasing them has no
    /// further effect.
    pub fn clear(&self) {
        let drained = self.shared.drain();
        tracing::debug!(cache.name = %self.shared.name, cache.evicted = drained, "cache.cleared");
    }
}

impl<V> Shared<V> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn retention(&self) -> Retention {
        self.retention
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Removes an item that has just been marked destroyed and tears it down.
    pub(crate) fn evict(&self, item: &RetentionItem<V>) {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.get(item.key()) {
                Some(current) if current.ptr_eq(item) => entries.remove(item.key()),
                _ => None,
            }
        };
        drop(removed);

        tracing::debug!(cache.name = %self.name, cache.key = %item.key(), "cache.evicted");
        self.teardown(item);
    }

    /// Runs the cleanup function, containing any panic it raises.
    pub(crate) fn teardown(&self, item: &RetentionItem<V>) {
        let Some(cleanup) = &self.cleanup else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| cleanup(item.value()))).is_err() {
            tracing::error!(cache.name = %self.name, cache.key = %item.key(), "cache.cleanup_panicked");
        }
    }

    fn drain(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().map(|(_, item)| item).collect();

        let mut evicted = 0;
        for item in &drained {
            if item.mark_destroyed() {
                self.teardown(item);
                evicted += 1;
            }
        }
        evicted
    }
}

impl<V> Drop for Shared<V> {
    fn drop(&mut self) {
        let evicted = self.drain();
        if evicted > 0 {
            tracing::debug!(cache.name = %self.name, cache.evicted = evicted, "cache.dropped");
        }
    }
}

impl<P: ?Sized, V> Clone for RetentionCache<P, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            generator: Arc::clone(&self.generator),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<P: ?Sized, V> Debug for RetentionCache<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionCache")
            .field("name", &self.shared.name)
            .field("retention", &self.shared.retention)
            .field("entries", &self.shared.entries.lock().len())
            .finish_non_exhaustive()
    }
}
