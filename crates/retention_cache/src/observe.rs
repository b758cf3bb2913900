// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers that turn stores and cache entries into managed observations.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use futures_util::future::select_all;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cache::RetentionCache;
use crate::emitter::Subscription;
use crate::error::EncodeError;
use crate::store::Store;

/// A live view of a store's value.
///
/// The observation starts out holding the store's current value and follows every later
/// emission. Dropping it detaches from the store and, for observations obtained from a cache,
/// releases the cache entry.
pub struct Observation<C> {
    receiver: watch::Receiver<C>,
    // the handler is detached before the lease that keeps the store alive is released
    subscriptions: Vec<Subscription>,
}

impl<C> Observation<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn attach<S>(store: &S) -> Self
    where
        S: Store<Content = C> + ?Sized,
    {
        // The handler goes in first so nothing published during the read below is lost. A value
        // pushed before the channel opens wins over the read; anything newer is still on its way
        // to the handler.
        let relay = Arc::new(Mutex::new(Relay::Buffering(None)));
        let subscription = {
            let relay = Arc::clone(&relay);
            store.on(Arc::new(move |value: &C| relay.lock().deliver(value)))
        };
        let current = store.current();
        let receiver = relay.lock().open(current);

        Self {
            receiver,
            subscriptions: vec![subscription],
        }
    }

    fn hold(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Returns the latest value.
    #[must_use]
    pub fn get(&self) -> C {
        self.receiver.borrow().clone()
    }

    /// Borrows the latest value without cloning it.
    ///
    /// The store cannot publish while the borrow is held, so keep it short.
    pub fn borrow(&self) -> watch::Ref<'_, C> {
        self.receiver.borrow()
    }

    /// Returns `true` if a value arrived since the last [`changed`](Self::changed) or
    /// [`mark_seen`](Self::mark_seen).
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }

    /// Marks the latest value as seen.
    pub fn mark_seen(&mut self) {
        self.receiver.mark_unchanged();
    }

    /// Waits for the store to emit.
    ///
    /// Returns `false` once the store has dropped this observation's handler, for example
    /// because it was closed; no further values will arrive.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

/// Forwards store emissions into an observation's channel.
enum Relay<C> {
    /// The channel is not open yet; holds the latest value pushed so far.
    Buffering(Option<C>),
    Live(watch::Sender<C>),
}

impl<C: Clone> Relay<C> {
    fn deliver(&mut self, value: &C) {
        match self {
            Self::Buffering(pending) => *pending = Some(value.clone()),
            Self::Live(sender) => {
                sender.send_replace(value.clone());
            }
        }
    }

    fn open(&mut self, current: C) -> watch::Receiver<C> {
        let initial = match self {
            Self::Buffering(pending) => pending.take().unwrap_or(current),
            Self::Live(sender) => return sender.subscribe(),
        };

        let (sender, receiver) = watch::channel(initial);
        *self = Self::Live(sender);
        receiver
    }
}

impl<C: Debug> Debug for Observation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("current", &*self.receiver.borrow())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// Observes `store`, starting from its current value.
///
/// # Examples
///
/// ```
/// use retention_cache::{ValueStore, observe};
///
/// let store = ValueStore::new("loading");
/// let observation = observe(&store);
/// assert_eq!(observation.get(), "loading");
///
/// store.set("ready");
/// assert_eq!(observation.get(), "ready");
/// ```
pub fn observe<S>(store: &S) -> Observation<S::Content>
where
    S: Store + ?Sized,
{
    Observation::attach(store)
}

/// Observes the store cached for `param`, holding the cache entry for as long as the
/// observation lives.
///
/// An absent `param` means there is nothing to observe: `Ok(None)` is returned and the
/// generator is not called.
///
/// # Errors
///
/// Returns an [`EncodeError`] if `param` has no canonical key encoding.
///
/// # Examples
///
/// ```
/// use retention_cache::{RetentionCache, ValueStore, observe_from_cache};
/// use tick::Clock;
///
/// # fn main() -> Result<(), retention_cache::EncodeError> {
/// let cache = RetentionCache::builder(Clock::new_frozen(), |id: &u32| ValueStore::new(*id * 10))
///     .cleanup(ValueStore::close)
///     .build();
///
/// let observation = observe_from_cache(&cache, Some(&4))?.expect("param is present");
/// assert_eq!(observation.get(), 40);
/// assert!(cache.contains(&4)?);
///
/// drop(observation);
/// assert!(!cache.contains(&4)?);
///
/// assert!(observe_from_cache(&cache, None)?.is_none());
/// # Ok(())
/// # }
/// ```
pub fn observe_from_cache<P, V>(
    cache: &RetentionCache<P, V>,
    param: Option<&P>,
) -> Result<Option<Observation<V::Content>>, EncodeError>
where
    P: ?Sized + 'static,
    V: Store + 'static,
{
    let Some(param) = param else {
        return Ok(None);
    };

    let lease = cache.subscribe(param)?;
    let mut observation = Observation::attach(&*lease);
    observation.hold(lease.into());
    Ok(Some(observation))
}

/// Observes one cache entry per named parameter.
///
/// The result always has exactly the keys of `params`. Keys whose parameter is absent report
/// `default`.
///
/// # Errors
///
/// Returns an [`EncodeError`] if any parameter has no canonical key encoding. Entries observed
/// before the failing one are released.
pub fn observe_multiple<K, P, V>(
    cache: &RetentionCache<P, V>,
    params: &BTreeMap<K, Option<P>>,
    default: V::Content,
) -> Result<MultiObservation<K, V::Content>, EncodeError>
where
    K: Ord + Clone,
    P: 'static,
    V: Store + 'static,
{
    let entries = params
        .iter()
        .map(|(key, param)| Ok((key.clone(), observe_from_cache(cache, param.as_ref())?)))
        .collect::<Result<BTreeMap<_, _>, EncodeError>>()?;

    Ok(MultiObservation { entries, default })
}

/// A set of named observations produced by [`observe_multiple`].
pub struct MultiObservation<K, C> {
    entries: BTreeMap<K, Option<Observation<C>>>,
    default: C,
}

impl<K, C> MultiObservation<K, C>
where
    K: Ord + Clone,
    C: Clone + Send + Sync + 'static,
{
    /// Returns the latest value for every key, or the default where the parameter was absent.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<K, C> {
        self.entries
            .iter()
            .map(|(key, observation)| (key.clone(), self.value_of(observation.as_ref())))
            .collect()
    }

    /// Returns the latest value for `key`, or `None` if `key` was not requested.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<C> {
        self.entries
            .get(key)
            .map(|observation| self.value_of(observation.as_ref()))
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no key was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Waits until any observed store emits.
    ///
    /// Returns `false` immediately if nothing is observed, and `false` when the store that
    /// woke the wait has dropped its handler.
    pub async fn changed(&mut self) -> bool {
        let waiting: Vec<_> = self
            .entries
            .values_mut()
            .flatten()
            .map(|observation| Box::pin(observation.changed()))
            .collect();

        if waiting.is_empty() {
            return false;
        }

        let (changed, _, _) = select_all(waiting).await;
        changed
    }

    fn value_of(&self, observation: Option<&Observation<C>>) -> C {
        observation.map_or_else(|| self.default.clone(), Observation::get)
    }
}

impl<K: Debug, C: Debug> Debug for MultiObservation<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiObservation")
            .field("entries", &self.entries)
            .field("default", &self.default)
            .finish()
    }
}
