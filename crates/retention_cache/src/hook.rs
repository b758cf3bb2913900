// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Observability hooks for [`Emitter`](crate::Emitter) handler churn.
//!
//! A leaked subscription shows up as a handler count that never returns to zero. Hooks are
//! handed to an emitter at construction, so diagnosing leaks needs no global state.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Receives handler attach, detach and close notifications from an emitter.
///
/// All methods default to doing nothing. They are called after the emitter has updated its
/// handler set and without any emitter lock held.
pub trait EmitterHook: Send + Sync + Debug {
    /// A handler was registered; `active` is the number of handlers now registered.
    fn attached(&self, label: &str, active: usize) {
        let _ = (label, active);
    }

    /// A handler was removed; `active` is the number of handlers still registered.
    fn detached(&self, label: &str, active: usize) {
        let _ = (label, active);
    }

    /// The emitter was closed and `dropped` handlers were flushed.
    fn closed(&self, label: &str, dropped: usize) {
        let _ = (label, dropped);
    }
}

/// A hook that ignores every notification. This is the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl EmitterHook for NoopHook {}

/// A hook that reports handler churn as `trace` level `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl EmitterHook for TracingHook {
    fn attached(&self, label: &str, active: usize) {
        tracing::trace!(emitter.label = label, emitter.active = active, "emitter.attach");
    }

    fn detached(&self, label: &str, active: usize) {
        tracing::trace!(emitter.label = label, emitter.active = active, "emitter.detach");
    }

    fn closed(&self, label: &str, dropped: usize) {
        tracing::trace!(emitter.label = label, emitter.dropped = dropped, "emitter.close");
    }
}

/// Counts live handlers per emitter label, across every emitter sharing the hook.
///
/// Clones share the same counters, so one instance can be handed to many emitters and
/// inspected from a test or a debug endpoint.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use retention_cache::{DebugCounters, Emitter};
///
/// let counters = DebugCounters::new();
/// let emitter = Emitter::<u32>::with_hook("documents", Arc::new(counters.clone()));
///
/// let subscription = emitter.on(|_| {});
/// assert_eq!(counters.count("documents"), 1);
///
/// subscription.unsubscribe();
/// assert_eq!(counters.total(), 0);
/// ```
#[derive(Debug, Default, Clone)]
pub struct DebugCounters {
    state: Arc<Mutex<CounterState>>,
    verbose: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct CounterState {
    per_label: HashMap<String, usize>,
    total: usize,
}

impl CounterState {
    fn add(&mut self, label: &str, count: usize) -> (usize, usize) {
        self.total += count;
        let entry = self.per_label.entry(label.to_owned()).or_default();
        *entry += count;
        (*entry, self.total)
    }

    fn sub(&mut self, label: &str, count: usize) -> (usize, usize) {
        self.total = self.total.saturating_sub(count);
        let remaining = match self.per_label.get_mut(label) {
            Some(entry) => {
                *entry = entry.saturating_sub(count);
                *entry
            }
            None => 0,
        };
        if remaining == 0 {
            self.per_label.remove(label);
        }
        (remaining, self.total)
    }
}

impl DebugCounters {
    /// Creates a set of counters with verbose logging disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables a `debug` level event for every change.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Returns the number of live handlers registered under `label`.
    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.state.lock().per_label.get(label).copied().unwrap_or_default()
    }

    /// Returns the number of live handlers across all labels.
    #[must_use]
    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    /// Returns the non-zero per-label counts.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.state
            .lock()
            .per_label
            .iter()
            .map(|(label, count)| (label.clone(), *count))
            .collect()
    }

    fn log(&self, event: &'static str, label: &str, count: usize, total: usize) {
        if self.verbose.load(Ordering::Relaxed) {
            tracing::debug!(emitter.label = label, emitter.count = count, emitter.total = total, "{event}");
        }
    }
}

impl EmitterHook for DebugCounters {
    fn attached(&self, label: &str, _active: usize) {
        let (count, total) = self.state.lock().add(label, 1);
        self.log("emitter.attach", label, count, total);
    }

    fn detached(&self, label: &str, _active: usize) {
        let (count, total) = self.state.lock().sub(label, 1);
        self.log("emitter.detach", label, count, total);
    }

    fn closed(&self, label: &str, dropped: usize) {
        let (count, total) = self.state.lock().sub(label, dropped);
        self.log("emitter.close", label, count, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LogCapture;

    #[test]
    fn counters_track_labels_independently() {
        let counters = DebugCounters::new();
        counters.attached("docs", 1);
        counters.attached("docs", 2);
        counters.attached("queries", 1);

        assert_eq!(counters.count("docs"), 2);
        assert_eq!(counters.count("queries"), 1);
        assert_eq!(counters.total(), 3);

        counters.detached("docs", 1);
        assert_eq!(counters.count("docs"), 1);
        assert_eq!(counters.total(), 2);
    }

    #[test]
    fn close_flushes_label_and_forgets_it() {
        let counters = DebugCounters::new();
        counters.attached("auth", 1);
        counters.attached("auth", 2);
        counters.closed("auth", 2);

        assert_eq!(counters.count("auth"), 0);
        assert_eq!(counters.total(), 0);
        assert!(counters.snapshot().is_empty());
    }

    #[test]
    fn clones_share_state() {
        let counters = DebugCounters::new();
        let clone = counters.clone();
        clone.attached("docs", 1);
        assert_eq!(counters.count("docs"), 1);
    }

    #[test]
    fn verbose_counters_log_changes() {
        let (capture, _guard) = LogCapture::install();

        let counters = DebugCounters::new();
        counters.attached("quiet", 1);
        assert!(capture.output().is_empty());

        counters.set_verbose(true);
        counters.attached("loud", 1);
        capture.assert_logged("emitter.attach");
        capture.assert_logged("loud");
    }

    #[test]
    fn tracing_hook_emits_trace_events() {
        let (capture, _guard) = LogCapture::install();

        TracingHook.attached("docs", 3);
        TracingHook.closed("docs", 3);

        capture.assert_logged("emitter.attach");
        capture.assert_logged("emitter.close");
        capture.assert_logged("TRACE");
    }
}
