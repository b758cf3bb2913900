// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for the entry lifecycle of a retention cache driven by a controlled clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use retention_cache::{Retention, RetentionCache, Store, ValueStore, observe_from_cache};
use serde::Serialize;
use tick::{Clock, ClockControl};

type TestResult = Result<(), retention_cache::EncodeError>;

const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Records what the generator and cleanup functions were called with.
#[derive(Debug, Default, Clone)]
struct Journal {
    generated: Arc<AtomicUsize>,
    cleaned: Arc<Mutex<Vec<u32>>>,
}

impl Journal {
    fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    fn cleaned(&self) -> Vec<u32> {
        self.cleaned.lock().clone()
    }
}

fn counter_cache(clock: Clock, retention: impl Into<Retention>) -> (RetentionCache<str, ValueStore<u32>>, Journal) {
    let journal = Journal::default();
    let generated = Arc::clone(&journal.generated);
    let cleaned = Arc::clone(&journal.cleaned);

    let cache = RetentionCache::builder(clock, move |_: &str| {
        generated.fetch_add(1, Ordering::SeqCst);
        ValueStore::new(0)
    })
    .name("counters")
    .retention(retention)
    .cleanup(move |store: &ValueStore<u32>| {
        cleaned.lock().push(store.current());
        store.close();
    })
    .build();

    (cache, journal)
}

#[tokio::test]
async fn shared_resource_survives_observer_churn() -> TestResult {
    let control = ClockControl::new();
    let (cache, journal) = counter_cache(control.to_clock(), millis(100));

    // 100 mount/unmount cycles, each well inside the grace period
    for _ in 0..100 {
        let observation = observe_from_cache(&cache, Some("room"))?;
        drop(observation);
        settle().await;
        control.advance(millis(10));
        settle().await;
    }

    assert_eq!(journal.generated(), 1);
    assert!(journal.cleaned().is_empty());
    assert!(cache.contains("room")?);
    Ok(())
}

#[tokio::test]
async fn cleanup_fires_only_when_net_count_is_zero() -> TestResult {
    let control = ClockControl::new();
    let (cache, journal) = counter_cache(control.to_clock(), millis(100));

    let a = cache.subscribe("doc")?;
    let b = cache.subscribe("doc")?;
    let c = cache.subscribe("doc")?;
    assert_eq!(a.item().ref_count(), 3);

    a.release();
    c.release();
    settle().await;
    control.advance(millis(500));
    settle().await;
    assert!(journal.cleaned().is_empty(), "one lease is still held");

    b.release();
    settle().await;
    control.advance(millis(99));
    settle().await;
    assert!(journal.cleaned().is_empty());

    control.advance(millis(1));
    settle().await;
    assert_eq!(journal.cleaned(), [0]);
    assert!(cache.is_empty());
    Ok(())
}

#[tokio::test]
async fn reattach_after_expiry_builds_fresh_resource() -> TestResult {
    let control = ClockControl::new();
    let (cache, journal) = counter_cache(control.to_clock(), millis(100));

    let first = cache.subscribe("doc")?;
    first.set(5);
    first.release();
    settle().await;
    control.advance(millis(150));
    settle().await;

    let second = cache.subscribe("doc")?;
    assert_eq!(second.current(), 0, "a new instance starts from scratch");
    assert_eq!(journal.generated(), 2);
    assert_eq!(journal.cleaned(), [5]);
    Ok(())
}

#[tokio::test]
async fn distinct_keys_have_independent_timers() -> TestResult {
    let control = ClockControl::new();
    let (cache, journal) = counter_cache(control.to_clock(), millis(100));

    cache.subscribe("early")?.release();
    settle().await;
    control.advance(millis(50));
    settle().await;
    cache.subscribe("late")?.release();
    settle().await;

    control.advance(millis(50));
    settle().await;
    assert!(!cache.contains("early")?);
    assert!(cache.contains("late")?);

    control.advance(millis(50));
    settle().await;
    assert!(cache.is_empty());
    assert_eq!(journal.cleaned().len(), 2);
    Ok(())
}

#[tokio::test]
async fn immediate_mode_tears_down_on_release() -> TestResult {
    let (cache, journal) = counter_cache(Clock::new_frozen(), Retention::Immediate);

    let lease = cache.subscribe("doc")?;
    lease.set(3);
    lease.release();

    assert_eq!(journal.cleaned(), [3]);
    assert!(cache.is_empty());

    let _again = cache.subscribe("doc")?;
    assert_eq!(journal.generated(), 2);
    Ok(())
}

#[tokio::test]
async fn zero_grace_evicts_on_next_turn() -> TestResult {
    let control = ClockControl::new();
    let (cache, journal) = counter_cache(control.to_clock(), Duration::ZERO);

    cache.subscribe("doc")?.release();
    assert!(cache.contains("doc")?, "eviction is deferred to the timer task");

    settle().await;
    assert!(!cache.contains("doc")?);
    assert_eq!(journal.cleaned().len(), 1);
    Ok(())
}

#[tokio::test]
async fn lookup_alone_starts_the_grace_period() -> TestResult {
    let control = ClockControl::new();
    let (cache, journal) = counter_cache(control.to_clock(), millis(100));

    let item = cache.get_item("peek")?;
    assert!(item.has_pending_cleanup());
    settle().await;

    control.advance(millis(100));
    settle().await;
    assert!(!item.is_live());
    assert_eq!(journal.cleaned().len(), 1);
    Ok(())
}

#[test]
fn structured_params_are_canonicalized() -> TestResult {
    #[derive(Serialize)]
    struct Query {
        collection: &'static str,
        limit: Option<u32>,
        filters: Vec<(&'static str, &'static str)>,
    }

    #[derive(Serialize)]
    struct ReorderedQuery {
        filters: Vec<(&'static str, &'static str)>,
        collection: &'static str,
    }

    #[derive(Serialize)]
    #[serde(untagged)]
    enum Param {
        Query(Query),
        Reordered(ReorderedQuery),
    }

    let generated = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&generated);
    let cache = RetentionCache::builder(Clock::new_frozen(), move |_: &Param| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .build();

    let a = Param::Query(Query {
        collection: "rooms",
        limit: None,
        filters: vec![("owner", "ada")],
    });
    let b = Param::Reordered(ReorderedQuery {
        filters: vec![("owner", "ada")],
        collection: "rooms",
    });

    assert_eq!(cache.key_for(&a)?, cache.key_for(&b)?);
    let _a = cache.subscribe(&a)?;
    let _b = cache.subscribe(&b)?;
    assert_eq!(generated.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn clear_closes_stores_of_live_observers() -> TestResult {
    let control = ClockControl::new();
    let (cache, journal) = counter_cache(control.to_clock(), millis(100));

    let mut observation = observe_from_cache(&cache, Some("doc"))?.expect("param is present");
    cache.clear();

    assert_eq!(journal.cleaned(), [0]);
    assert!(!observation.changed().await, "the closed store drops its handlers");
    Ok(())
}
