// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end walk through a shared counter resource with two consumers and a grace period.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use retention_cache::{RetentionCache, ValueStore, observe_from_cache};
use tick::ClockControl;

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Advances the controlled clock to `target` milliseconds after the start.
async fn advance_to(control: &ClockControl, now: &mut u64, target: u64) {
    control.advance(Duration::from_millis(target - *now));
    *now = target;
    settle().await;
}

#[tokio::test]
async fn counter_shared_across_consumers() -> Result<(), retention_cache::EncodeError> {
    let control = ClockControl::new();
    let mut now = 0;

    let generated = Arc::new(AtomicUsize::new(0));
    let cleaned = Arc::new(AtomicUsize::new(0));
    let cache = {
        let generated = Arc::clone(&generated);
        let cleaned = Arc::clone(&cleaned);
        RetentionCache::builder(control.to_clock(), move |_: &&str| {
            generated.fetch_add(1, Ordering::SeqCst);
            ValueStore::new(0_u32)
        })
        .name("counters")
        .retention(Duration::from_millis(100))
        .cleanup(move |store: &ValueStore<u32>| {
            cleaned.fetch_add(1, Ordering::SeqCst);
            store.close();
        })
        .build()
    };
    let key = "counter";

    // t=0: consumer A attaches and sees the initial value
    let mut a = observe_from_cache(&cache, Some(&key))?.expect("key is present");
    assert_eq!(a.get(), 0);

    // t=10: the resource emits
    advance_to(&control, &mut now, 10).await;
    cache.get_item(&key)?.value().set(1);
    assert!(a.changed().await);
    assert_eq!(a.get(), 1);

    // t=20: A detaches
    advance_to(&control, &mut now, 20).await;
    drop(a);
    settle().await;

    // t=50: B attaches to the same instance and sees the latest value at once
    advance_to(&control, &mut now, 50).await;
    let b = observe_from_cache(&cache, Some(&key))?.expect("key is present");
    assert_eq!(b.get(), 1);
    assert_eq!(generated.load(Ordering::SeqCst), 1);

    // t=60: B detaches
    advance_to(&control, &mut now, 60).await;
    drop(b);
    settle().await;

    // t=159: still within the grace period
    advance_to(&control, &mut now, 159).await;
    assert_eq!(cleaned.load(Ordering::SeqCst), 0);
    assert!(cache.contains(&key)?);

    // t=160: the grace period has elapsed
    advance_to(&control, &mut now, 160).await;
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    assert!(!cache.contains(&key)?);

    // nothing else fires later
    advance_to(&control, &mut now, 1_000).await;
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    assert_eq!(generated.load(Ordering::SeqCst), 1);
    Ok(())
}
