// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The store protocol implemented by cached resources.

use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::emitter::{Emitter, Handler, Subscription};
use crate::hook::EmitterHook;

/// A resource that exposes a current value and pushes every change.
///
/// Stores are what a [`RetentionCache`](crate::RetentionCache) generator typically returns: a
/// handle over some live subscription (a realtime document, a query, an in-flight request) that
/// owns its own [`Emitter`]. Failures of the underlying subscription are not reported out of band;
/// they are part of `Content` and delivered like any other value.
pub trait Store: Send + Sync {
    /// The value type the store holds and emits.
    type Content: Clone + Send + Sync + 'static;

    /// Returns the current value.
    fn current(&self) -> Self::Content;

    /// Registers `handler` for every later change.
    ///
    /// The current value is not replayed; read it with [`current`](Self::current).
    fn on(&self, handler: Handler<Self::Content>) -> Subscription;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    type Content = S::Content;

    fn current(&self) -> Self::Content {
        (**self).current()
    }

    fn on(&self, handler: Handler<Self::Content>) -> Subscription {
        (**self).on(handler)
    }
}

/// A store holding a value set by its owner.
///
/// This is the building block most resource producers need: the producer keeps a clone, calls
/// [`set`](Self::set) whenever its underlying subscription delivers, and calls
/// [`close`](Self::close) from the cache cleanup function.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use parking_lot::Mutex;
/// use retention_cache::{Store, ValueStore};
///
/// let store = ValueStore::new(0);
/// let seen = Arc::new(Mutex::new(Vec::new()));
///
/// let seen_by_handler = Arc::clone(&seen);
/// let _subscription = store.on(Arc::new(move |value: &i32| seen_by_handler.lock().push(*value)));
///
/// store.set(1);
/// store.update(|value| *value += 1);
///
/// assert_eq!(store.current(), 2);
/// assert_eq!(*seen.lock(), [1, 2]);
/// ```
pub struct ValueStore<C> {
    inner: Arc<ValueStoreInner<C>>,
}

struct ValueStoreInner<C> {
    current: Mutex<C>,
    emitter: Emitter<C>,
}

impl<C> ValueStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Creates a store holding `initial`.
    #[must_use]
    pub fn new(initial: C) -> Self {
        Self::with_emitter(initial, Emitter::new())
    }

    /// Creates a store whose emitter reports to `hook` under `label`.
    #[must_use]
    pub fn with_hook(initial: C, label: impl Into<Cow<'static, str>>, hook: Arc<dyn EmitterHook>) -> Self {
        Self::with_emitter(initial, Emitter::with_hook(label, hook))
    }

    fn with_emitter(initial: C, emitter: Emitter<C>) -> Self {
        Self {
            inner: Arc::new(ValueStoreInner {
                current: Mutex::new(initial),
                emitter,
            }),
        }
    }

    /// Replaces the current value and emits it.
    pub fn set(&self, value: C) {
        *self.inner.current.lock() = value.clone();
        self.inner.emitter.emit(&value);
    }

    /// Modifies the current value in place and emits the result.
    pub fn update(&self, f: impl FnOnce(&mut C)) {
        let value = {
            let mut current = self.inner.current.lock();
            f(&mut current);
            current.clone()
        };
        self.inner.emitter.emit(&value);
    }

    /// Removes every handler.
    pub fn close(&self) {
        self.inner.emitter.close();
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.emitter.len()
    }
}

impl<C> Store for ValueStore<C>
where
    C: Clone + Send + Sync + 'static,
{
    type Content = C;

    fn current(&self) -> C {
        self.inner.current.lock().clone()
    }

    fn on(&self, handler: Handler<C>) -> Subscription {
        self.inner.emitter.on_handler(handler)
    }
}

impl<C> Clone for ValueStore<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Debug> Debug for ValueStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueStore")
            .field("current", &*self.inner.current.lock())
            .field("emitter", &self.inner.emitter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::DebugCounters;

    fn record<C: Clone + Send + Sync + 'static>(store: &impl Store<Content = C>) -> (Arc<Mutex<Vec<C>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = store.on(Arc::new(move |value: &C| sink.lock().push(value.clone())));
        (seen, subscription)
    }

    #[test]
    fn set_updates_current_and_emits() {
        let store = ValueStore::new("a".to_owned());
        let (seen, _subscription) = record(&store);

        store.set("b".to_owned());

        assert_eq!(store.current(), "b");
        assert_eq!(*seen.lock(), ["b"]);
    }

    #[test]
    fn on_does_not_replay_current() {
        let store = ValueStore::new(5);
        let (seen, _subscription) = record(&store);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn handler_can_read_current_during_emit() {
        let store = ValueStore::new(0);
        let observed = Arc::new(Mutex::new(None));

        let _subscription = {
            let store = store.clone();
            let observed = Arc::clone(&observed);
            store.clone().on(Arc::new(move |_: &i32| *observed.lock() = Some(store.current())))
        };

        store.set(3);
        assert_eq!(*observed.lock(), Some(3));
    }

    #[test]
    fn close_flushes_handlers() {
        let counters = DebugCounters::new();
        let store = ValueStore::with_hook(0, "counter", Arc::new(counters.clone()));
        let (seen, subscription) = record(&store);
        assert_eq!(counters.count("counter"), 1);

        store.close();
        store.set(1);

        assert!(seen.lock().is_empty());
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(counters.total(), 0);
        subscription.unsubscribe();
    }

    #[test]
    fn arc_store_forwards() {
        let store = Arc::new(ValueStore::new(1));
        let (seen, _subscription) = record(&store);
        store.set(2);
        assert_eq!(Store::current(&store), 2);
        assert_eq!(*seen.lock(), [2]);
    }

    #[test]
    fn errors_travel_as_values() {
        let store: ValueStore<Result<u32, String>> = ValueStore::new(Ok(0));
        let (seen, _subscription) = record(&store);

        store.set(Err("permission denied".to_owned()));
        store.set(Ok(4));

        assert_eq!(*seen.lock(), [Err("permission denied".to_owned()), Ok(4)]);
    }
}
