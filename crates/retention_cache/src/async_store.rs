// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A store over the outcome of a single future.

use std::error::Error;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tick::Clock;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::cache::RetentionCache;
use crate::emitter::{Handler, Subscription};
use crate::store::{Store, ValueStore};

/// Retention used by [`async_cache`] when none is given.
pub const DEFAULT_ASYNC_RETENTION: Duration = Duration::from_millis(1000);

/// The progress of the future behind an [`AsyncStore`].
pub enum AsyncState<R, E> {
    /// The future has not completed yet.
    Pending,

    /// The future produced a value.
    Ready(R),

    /// The future failed.
    Failed(Arc<E>),
}

impl<R, E> AsyncState<R, E> {
    /// Returns `true` while the future is running.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns the produced value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&R> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl<R: Clone, E> Clone for AsyncState<R, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Ready(value) => Self::Ready(value.clone()),
            Self::Failed(error) => Self::Failed(Arc::clone(error)),
        }
    }
}

impl<R: Debug, E: Debug> Debug for AsyncState<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// A store that runs a future and publishes its outcome.
///
/// The store starts as [`AsyncState::Pending`] and emits exactly once, when the future
/// settles. A failure is logged and published as [`AsyncState::Failed`]; it is never raised
/// to observers any other way.
pub struct AsyncStore<R, E> {
    state: ValueStore<AsyncState<R, E>>,
    task: Arc<Mutex<Option<AbortHandle>>>,
}

impl<R, E> AsyncStore<R, E>
where
    R: Clone + Send + Sync + 'static,
    E: Error + Send + Sync + 'static,
{
    /// Spawns `future` on the current Tokio runtime.
    ///
    /// Outside a runtime the future is dropped and the store stays pending.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<R, E>> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => Self::spawn_on(&handle, future),
            Err(_) => {
                tracing::warn!("no tokio runtime to run the async store, it stays pending");
                Self {
                    state: ValueStore::new(AsyncState::Pending),
                    task: Arc::default(),
                }
            }
        }
    }

    /// Spawns `future` on `handle`.
    pub fn spawn_on<F>(handle: &Handle, future: F) -> Self
    where
        F: Future<Output = Result<R, E>> + Send + 'static,
    {
        let state = ValueStore::new(AsyncState::Pending);
        let publish = state.clone();

        let task = handle.spawn(async move {
            match future.await {
                Ok(value) => publish.set(AsyncState::Ready(value)),
                Err(error) => {
                    tracing::error!(error = &error as &dyn Error, "async_store.failed");
                    publish.set(AsyncState::Failed(Arc::new(error)));
                }
            }
        });

        Self {
            state,
            task: Arc::new(Mutex::new(Some(task.abort_handle()))),
        }
    }

    /// Stops the future if it is still running and removes every handler.
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.state.close();
    }
}

impl<R, E> Store for AsyncStore<R, E>
where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type Content = AsyncState<R, E>;

    fn current(&self) -> Self::Content {
        self.state.current()
    }

    fn on(&self, handler: Handler<Self::Content>) -> Subscription {
        self.state.on(handler)
    }
}

impl<R, E> Clone for AsyncStore<R, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            task: Arc::clone(&self.task),
        }
    }
}

impl<R: Debug, E: Debug> Debug for AsyncStore<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStore")
            .field("state", &self.state)
            .field("running", &self.task.lock().is_some())
            .finish()
    }
}

/// Builds a retention cache of [`AsyncStore`]s, one per distinct parameter.
///
/// Each miss calls `handler` and runs the returned future. Evicted stores are closed. When
/// `retention` is `None`, entries are kept for [`DEFAULT_ASYNC_RETENTION`] after their last
/// observer leaves.
///
/// # Examples
///
/// ```
/// use retention_cache::{async_cache, observe_from_cache};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), retention_cache::EncodeError> {
/// let cache = async_cache(Clock::new_tokio(), |id: &u32| {
///     let id = *id;
///     async move { Ok::<_, std::io::Error>(format!("user {id}")) }
/// }, None);
///
/// let mut observation = observe_from_cache(&cache, Some(&7))?.expect("param is present");
/// if observation.get().is_pending() {
///     observation.changed().await;
/// }
/// assert_eq!(observation.get().value().map(String::as_str), Some("user 7"));
/// # Ok(())
/// # }
/// ```
pub fn async_cache<P, R, E, F, Fut>(
    clock: Clock,
    handler: F,
    retention: Option<Duration>,
) -> RetentionCache<P, AsyncStore<R, E>>
where
    P: Serialize + ?Sized + 'static,
    R: Clone + Send + Sync + 'static,
    E: Error + Send + Sync + 'static,
    F: Fn(&P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    RetentionCache::builder(clock, move |param: &P| AsyncStore::new(handler(param)))
        .name("async_cache")
        .retention(retention.unwrap_or(DEFAULT_ASYNC_RETENTION))
        .cleanup(AsyncStore::close)
        .build()
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tick::ClockControl;
    use tokio::sync::oneshot;

    use super::*;
    use crate::observe::{observe, observe_from_cache};
    use crate::testing::{LogCapture, millis, settle};

    #[tokio::test]
    async fn publishes_value_once_ready() {
        let (sender, receiver) = oneshot::channel::<u32>();
        let store = AsyncStore::new(async move { receiver.await.map_err(io::Error::other) });
        let mut observation = observe(&store);
        assert!(observation.get().is_pending());

        sender.send(5).unwrap();
        assert!(observation.changed().await);

        assert_eq!(observation.get().value(), Some(&5));
    }

    #[tokio::test]
    async fn failure_is_logged_and_published() {
        let (capture, _guard) = LogCapture::install();

        let store: AsyncStore<u32, io::Error> = AsyncStore::new(async { Err(io::Error::other("backend unavailable")) });
        settle().await;

        let state = store.current();
        assert_eq!(state.error().map(ToString::to_string).as_deref(), Some("backend unavailable"));
        capture.assert_logged("async_store.failed");
        capture.assert_logged("backend unavailable");
    }

    #[tokio::test]
    async fn close_aborts_running_future() {
        let (_sender, receiver) = oneshot::channel::<u32>();
        let store = AsyncStore::new(async move { receiver.await.map_err(io::Error::other) });
        let observation = observe(&store);

        store.close();
        settle().await;

        assert!(store.current().is_pending());
        assert!(format!("{store:?}").contains("running: false"));
        drop(observation);
    }

    #[test]
    fn outside_runtime_stays_pending() {
        let store: AsyncStore<u32, io::Error> = AsyncStore::new(async { Ok(1) });
        assert!(store.current().is_pending());
    }

    #[test]
    fn state_accessors() {
        let ready: AsyncState<u32, io::Error> = AsyncState::Ready(3);
        assert_eq!(ready.value(), Some(&3));
        assert!(ready.error().is_none());
        assert!(!ready.is_pending());

        let failed: AsyncState<u32, io::Error> = AsyncState::Failed(Arc::new(io::Error::other("boom")));
        assert!(failed.value().is_none());
        assert!(failed.clone().error().is_some());
        assert!(format!("{failed:?}").starts_with("Failed"));
    }

    #[tokio::test]
    async fn async_cache_defaults_retention_and_shares_futures() {
        let control = ClockControl::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = async_cache(
            control.to_clock(),
            move |id: &u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                let id = *id;
                async move { Ok::<_, io::Error>(id * 2) }
            },
            None,
        );
        assert_eq!(cache.retention(), crate::Retention::Grace(DEFAULT_ASYNC_RETENTION));

        let first = observe_from_cache(&cache, Some(&21)).unwrap().unwrap();
        let second = observe_from_cache(&cache, Some(&21)).unwrap().unwrap();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.get().value(), Some(&42));
        assert_eq!(second.get().value(), Some(&42));

        drop(first);
        drop(second);
        settle().await;
        control.advance(millis(999));
        settle().await;
        assert!(cache.contains(&21).unwrap());

        control.advance(millis(1));
        settle().await;
        assert!(!cache.contains(&21).unwrap());
    }
}
