// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A keyed cache for shared, subscription-backed resources.
//!
//! Expensive live handles such as realtime listeners or in-flight requests are often wanted by
//! several consumers at once, and consumers come and go rapidly. This crate shares one resource
//! per distinct parameter, counts who is observing it, and tears it down once nobody has
//! observed it for a grace period.
//!
//! The pieces, leaves first:
//!
//! - [`encode_key`] derives a canonical [`CacheKey`] from any [`serde::Serialize`] parameter;
//! - [`Emitter`] broadcasts values to handlers, each registration held as a [`Subscription`];
//! - [`RetentionItem`] wraps one resource with its observer count, observers hold a [`Lease`];
//! - [`RetentionCache`] maps keys to items, constructing and evicting resources;
//! - [`Store`] is the contract a cached resource fulfils, and [`observe`],
//!   [`observe_from_cache`] and [`observe_multiple`] turn stores into live [`Observation`]s.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use retention_cache::{RetentionCache, ValueStore, observe_from_cache};
//! use tick::Clock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), retention_cache::EncodeError> {
//! // One counter store per document path, kept for 100ms after its last observer leaves.
//! let cache = RetentionCache::builder(Clock::new_tokio(), |_path: &String| ValueStore::new(0))
//!     .name("documents")
//!     .retention(Duration::from_millis(100))
//!     .cleanup(ValueStore::close)
//!     .build();
//!
//! let path = "rooms/lobby".to_owned();
//! let mut observation = observe_from_cache(&cache, Some(&path))?.expect("path is present");
//! assert_eq!(observation.get(), 0);
//!
//! cache.get_item(&path)?.value().set(1);
//! assert!(observation.changed().await);
//! assert_eq!(observation.get(), 1);
//! # Ok(())
//! # }
//! ```

mod async_store;
mod builder;
mod cache;
mod emitter;
mod error;
mod hook;
mod item;
mod key;
mod observe;
mod runtime;
mod store;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use async_store::{AsyncState, AsyncStore, DEFAULT_ASYNC_RETENTION, async_cache};
#[doc(inline)]
pub use builder::{Retention, RetentionCacheBuilder};
#[doc(inline)]
pub use cache::RetentionCache;
#[doc(inline)]
pub use emitter::{Emitter, Handler, Subscription};
#[doc(inline)]
pub use error::{EncodeError, EncodeErrorKind};
#[doc(inline)]
pub use hook::{DebugCounters, EmitterHook, NoopHook, TracingHook};
#[doc(inline)]
pub use item::{Lease, RetentionItem};
#[doc(inline)]
pub use key::{CacheKey, encode_key};
#[doc(inline)]
pub use observe::{MultiObservation, Observation, observe, observe_from_cache, observe_multiple};
#[doc(inline)]
pub use store::{Store, ValueStore};
