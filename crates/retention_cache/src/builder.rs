// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder and configuration types for constructing retention caches.

use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tick::Clock;
use tokio::runtime::Handle;

use crate::cache::{Cleanup, Generator, KeyFn, RetentionCache};
use crate::key::encode_key;
use crate::runtime::Runtime;

const DEFAULT_NAME: &str = "retention_cache";

/// How long an unreferenced entry is kept before it is torn down.
///
/// Serializes as `null` for [`Retention::Immediate`] and as whole milliseconds for
/// [`Retention::Grace`], so it can be read straight from a configuration file.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use retention_cache::Retention;
///
/// assert_eq!(Retention::default(), Retention::Immediate);
/// assert_eq!(
///     Retention::from(Duration::from_millis(250)),
///     Retention::Grace(Duration::from_millis(250))
/// );
/// assert_eq!(Retention::from(None), Retention::Immediate);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Retention {
    /// Tear down as soon as the last lease is released.
    #[default]
    Immediate,

    /// Keep the entry for this long after the last lease is released.
    Grace(Duration),
}

impl Retention {
    /// Returns the grace period, or `None` for immediate eviction.
    #[must_use]
    pub fn grace_period(self) -> Option<Duration> {
        match self {
            Self::Immediate => None,
            Self::Grace(duration) => Some(duration),
        }
    }
}

impl From<Duration> for Retention {
    fn from(duration: Duration) -> Self {
        Self::Grace(duration)
    }
}

impl From<Option<Duration>> for Retention {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::Immediate, Self::Grace)
    }
}

impl Serialize for Retention {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = self
            .grace_period()
            .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        millis.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Retention {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis).into())
    }
}

/// Builder for [`RetentionCache`].
///
/// Created by [`RetentionCache::builder`] or [`RetentionCache::builder_with_key`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use retention_cache::{Retention, RetentionCache};
/// use tick::Clock;
///
/// let clock = Clock::new_frozen();
/// let cache = RetentionCache::builder(clock, |id: &u64| format!("resource {id}"))
///     .name("resources")
///     .retention(Duration::from_secs(1))
///     .cleanup(|resource: &String| println!("closing {resource}"))
///     .build();
///
/// assert_eq!(cache.name(), "resources");
/// assert_eq!(cache.retention(), Retention::Grace(Duration::from_secs(1)));
/// ```
pub struct RetentionCacheBuilder<P: ?Sized, V> {
    clock: Clock,
    generator: Generator<P, V>,
    key_fn: KeyFn<P>,
    name: Cow<'static, str>,
    retention: Retention,
    cleanup: Option<Cleanup<V>>,
    handle: Option<Handle>,
}

impl<P, V> RetentionCacheBuilder<P, V>
where
    P: ?Sized + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(clock: Clock, generator: Generator<P, V>, key_fn: KeyFn<P>) -> Self {
        Self {
            clock,
            generator,
            key_fn,
            name: Cow::Borrowed(DEFAULT_NAME),
            retention: Retention::Immediate,
            cleanup: None,
            handle: None,
        }
    }

    /// Sets the name reported in log events.
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets how long unreferenced entries are retained.
    ///
    /// Accepts a [`Retention`], a [`Duration`] or an `Option<Duration>`. Leaving it unset means
    /// immediate eviction.
    #[must_use]
    pub fn retention(mut self, retention: impl Into<Retention>) -> Self {
        self.retention = retention.into();
        self
    }

    /// Sets the function that releases a resource once its entry is evicted.
    #[must_use]
    pub fn cleanup(mut self, cleanup: impl Fn(&V) + Send + Sync + 'static) -> Self {
        self.cleanup = Some(Arc::new(cleanup));
        self
    }

    /// Derives the cache key from `serializer(param)` instead of from the parameter itself.
    ///
    /// Use this when the parameter is a rich handle whose structure is unstable but which
    /// carries a stable identifying field, such as a path.
    #[must_use]
    pub fn key_serializer<K, F>(mut self, serializer: F) -> Self
    where
        K: Serialize,
        F: Fn(&P) -> K + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(move |param: &P| encode_key(&serializer(param)));
        self
    }

    /// Schedules grace timers on `handle` instead of on the runtime current at release time.
    #[must_use]
    pub fn tokio_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Builds the cache.
    #[must_use]
    pub fn build(self) -> RetentionCache<P, V> {
        RetentionCache::from_parts(
            self.name,
            self.retention,
            Runtime::new(self.clock, self.handle),
            self.cleanup,
            self.generator,
            self.key_fn,
        )
    }
}

impl<P: ?Sized, V> Debug for RetentionCacheBuilder<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionCacheBuilder")
            .field("name", &self.name)
            .field("retention", &self.retention)
            .field("cleanup", &self.cleanup.is_some())
            .field("tokio_handle", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}
