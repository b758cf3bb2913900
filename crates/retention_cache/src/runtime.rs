// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runtime abstraction for deferred eviction tasks.

use std::future::Future;

use tick::Clock;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// The clock and task spawner used by a cache.
///
/// Eviction timers are spawned on the configured handle, or on the runtime the caller is
/// running in when no handle was configured.
#[derive(Debug, Clone)]
pub(crate) struct Runtime {
    clock: Clock,
    handle: Option<Handle>,
}

impl Runtime {
    #[must_use]
    pub(crate) fn new(clock: Clock, handle: Option<Handle>) -> Self {
        Self { clock, handle }
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Spawns `work` and returns a handle that cancels it.
    ///
    /// Returns `None` when there is neither a configured handle nor an ambient runtime; `work`
    /// is dropped without running.
    pub(crate) fn spawn<T>(&self, work: T) -> Option<AbortHandle>
    where
        T: Future<Output = ()> + Send + 'static,
    {
        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => Handle::try_current().ok()?,
        };

        Some(handle.spawn(work).abort_handle())
    }
}
