// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Document Listener Example
//!
//! Shares one simulated realtime listener per document path between consumers that attach and
//! detach in quick succession. The listener survives the churn thanks to the grace period and
//! is torn down once everyone has left.

use std::sync::Arc;
use std::time::Duration;

use retention_cache::{Handler, RetentionCache, Store, Subscription, TracingHook, ValueStore, observe_from_cache};
use tick::Clock;
use tokio::task::JoinHandle;

/// The value a listener publishes: the document body or the error the backend reported.
type Snapshot = Result<String, String>;

/// A fake realtime subscription that publishes a new revision of a document periodically.
struct DocumentListener {
    store: ValueStore<Snapshot>,
    task: JoinHandle<()>,
}

impl DocumentListener {
    fn start(clock: &Clock, path: &str) -> Self {
        println!("attaching listener for {path}");
        let store = ValueStore::with_hook(Ok(String::new()), "documents", Arc::new(TracingHook));

        let task = {
            let store = store.clone();
            let clock = clock.clone();
            let path = path.to_owned();
            tokio::spawn(async move {
                for revision in 1.. {
                    clock.delay(Duration::from_millis(40)).await;
                    if revision == 4 {
                        store.set(Err(format!("{path}: permission denied")));
                    } else {
                        store.set(Ok(format!("{path} @ revision {revision}")));
                    }
                }
            })
        };

        Self { store, task }
    }

    fn stop(&self) {
        println!("detaching listener");
        self.task.abort();
        self.store.close();
    }
}

impl Store for DocumentListener {
    type Content = Snapshot;

    fn current(&self) -> Snapshot {
        self.store.current()
    }

    fn on(&self, handler: Handler<Snapshot>) -> Subscription {
        self.store.on(handler)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), retention_cache::EncodeError> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let clock = Clock::new_tokio();
    let listeners = {
        let clock = clock.clone();
        RetentionCache::builder(clock.clone(), move |path: &str| DocumentListener::start(&clock, path))
            .name("documents")
            .retention(Duration::from_millis(200))
            .cleanup(DocumentListener::stop)
            .build()
    };

    // A consumer that re-mounts every few milliseconds keeps reusing the same listener.
    for round in 0..5 {
        let mut observation = observe_from_cache(&listeners, Some("rooms/lobby"))?.expect("path is present");
        observation.changed().await;
        match observation.get() {
            Ok(body) => println!("round {round}: {body}"),
            Err(error) => println!("round {round}: error {error}"),
        }
    }

    // Nobody observes the document anymore; the listener is detached after the grace period.
    clock.delay(Duration::from_millis(300)).await;
    println!("listeners still cached: {}", listeners.len());

    Ok(())
}
