// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal multi-subscriber push channel.

use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::hook::{EmitterHook, NoopHook};

/// A shared handler invoked with every emitted value.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Broadcasts values to a set of registered handlers.
///
/// Each [`emit`](Self::emit) delivers to a snapshot of the handlers registered when it was
/// called, in registration order. Handlers run on the emitting thread without the emitter lock
/// held, so a handler may subscribe or unsubscribe (itself or others) while a broadcast is in
/// progress; such changes only take effect for the next broadcast.
///
/// Clones share the same handler set.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use retention_cache::Emitter;
///
/// let emitter = Emitter::new();
/// let seen = Arc::new(AtomicU32::new(0));
///
/// let subscription = {
///     let seen = Arc::clone(&seen);
///     emitter.on(move |value: &u32| seen.store(*value, Ordering::SeqCst))
/// };
///
/// emitter.emit(&7);
/// assert_eq!(seen.load(Ordering::SeqCst), 7);
///
/// subscription.unsubscribe();
/// emitter.emit(&8);
/// assert_eq!(seen.load(Ordering::SeqCst), 7);
/// ```
pub struct Emitter<T> {
    shared: Arc<EmitterShared<T>>,
}

struct EmitterShared<T> {
    label: Cow<'static, str>,
    hook: Arc<dyn EmitterHook>,
    state: Mutex<EmitterState<T>>,
}

struct EmitterState<T> {
    handlers: Vec<(u64, Handler<T>)>,
    // ids are never reused, so a stale subscription cannot remove a handler added after close
    next_id: u64,
}

impl<T> Emitter<T>
where
    T: 'static,
{
    /// Creates an emitter without an observability hook.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hook("emitter", Arc::new(NoopHook))
    }

    /// Creates an emitter that reports handler churn to `hook` under `label`.
    #[must_use]
    pub fn with_hook(label: impl Into<Cow<'static, str>>, hook: Arc<dyn EmitterHook>) -> Self {
        Self {
            shared: Arc::new(EmitterShared {
                label: label.into(),
                hook,
                state: Mutex::new(EmitterState {
                    handlers: Vec::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Registers `handler` and returns the subscription that removes it.
    pub fn on(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.on_handler(Arc::new(handler))
    }

    /// Registers an already shared handler.
    pub fn on_handler(&self, handler: Handler<T>) -> Subscription {
        let (id, active) = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.handlers.push((id, handler));
            (id, state.handlers.len())
        };
        self.shared.hook.attached(&self.shared.label, active);

        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || remove_handler(&shared, id))
    }

    /// Delivers `value` to every handler registered at the time of the call.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = self
            .shared
            .state
            .lock()
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            handler(value);
        }
    }

    /// Removes every handler.
    ///
    /// Outstanding subscriptions become no-ops. The emitter stays usable: handlers registered
    /// afterwards start a fresh set.
    pub fn close(&self) {
        let dropped = std::mem::take(&mut self.shared.state.lock().handlers);
        self.shared.hook.closed(&self.shared.label, dropped.len());
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().handlers.len()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the label reported to the hook.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

fn remove_handler<T>(shared: &Weak<EmitterShared<T>>, id: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let removed = {
        let mut state = shared.state.lock();
        state
            .handlers
            .iter()
            .position(|(handler_id, _)| *handler_id == id)
            .map(|index| {
                // dropped after the lock is released
                let removed = state.handlers.remove(index);
                (removed, state.handlers.len())
            })
    };

    if let Some((_handler, active)) = removed {
        shared.hook.detached(&shared.label, active);
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("label", &self.shared.label)
            .field("handlers", &self.shared.state.lock().handlers.len())
            .finish_non_exhaustive()
    }
}

/// A registration that is undone when it is unsubscribed or dropped.
///
/// Subscriptions are the release capability for both emitter handlers and cache observations.
/// They can be undone at most once; later attempts have no effect.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a release action.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Creates a subscription that releases nothing.
    pub fn empty() -> Self {
        Self { release: None }
    }

    /// Returns `true` until the subscription has been released.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Releases the subscription now.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("active", &self.is_active()).finish()
    }
}
