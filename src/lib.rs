#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About
//!
//! `async-query` is a framework-agnostic asynchronous state manager for
//! server data, in the spirit of [Tanstack Query](https://tanstack.com/query/latest/).
//!
//! A query provides:
//! - caching by structural key
//! - de-duplication of concurrent fetches
//! - invalidation with prefix matching
//! - background refetching (mount, focus, reconnect, interval)
//! - retries with capped, jittered backoff
//! - cooperative cancellation
//! - memory management with cache lifetimes
//! - mutations with the optimistic-update lifecycle
//! - infinite (paged) queries
//!
//! The crate has no opinion about rendering: observers broadcast plain
//! callbacks, and a host plugs its own reactivity on top. Everything is
//! single-threaded and cooperative; on native targets run it inside a
//! [`tokio::task::LocalSet`].
//!
//! # A simple example
//!
//! ```no_run
//! use async_query::{query_key, QueryClient, QueryOptions};
//! use std::time::Duration;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct User { name: String }
//!
//! async fn run() {
//!     let client = QueryClient::new();
//!
//!     let users = client.watch_query(
//!         query_key!["users", 1],
//!         |_ctx| async move { Ok(User { name: "ada".into() }) },
//!         QueryOptions::default().stale_time(Duration::from_secs(10)),
//!     );
//!
//!     let _listener = users.listen(|result| {
//!         if let Some(user) = &result.data {
//!             println!("{}", user.name);
//!         }
//!     });
//! }
//! ```

mod abort;
mod error;
mod focus_manager;
mod garbage_collector;
mod infinite_query;
mod instant;
mod mutation;
mod mutation_cache;
mod mutation_observer;
mod online_manager;
mod query;
mod query_cache;
mod query_client;
mod query_filters;
mod query_key;
mod query_observer;
mod query_options;
mod query_state;
mod time;
mod util;

pub use abort::{AbortController, AbortSignal};
pub use error::{CoreError, QueryError};
pub use focus_manager::{FocusManager, FocusSubscription};
pub use infinite_query::{
    FetchDirection, InfiniteData, InfiniteFnContext, InfiniteQueryObserver, InfiniteQueryOptions,
    InfiniteQueryResult,
};
pub use instant::Instant;
pub use mutation::{
    DefaultMutationOptions, MutationFnContext, MutationOptions, MutationScope, MutationState,
    MutationStatus,
};
pub use mutation_cache::{MutationCache, MutationCacheConfig, MutationEvent};
pub use mutation_observer::MutationObserver;
pub use online_manager::{OnlineManager, OnlineSubscription};
pub use query::QueryFnContext;
pub use query_cache::{CacheEvent, CacheSubscription, QueryCache};
pub use query_client::{DefaultOptions, QueryClient, QueryScope};
pub use query_filters::{
    MutationFilters, MutationSummary, QueryEntrySummary, QueryFilters, QueryTypeFilter,
    RefetchType,
};
pub use query_key::{KeyFloat, KeyValue, QueryKey};
pub use query_observer::{ListenerKey, QueryObserver, QueryObserverResult};
pub use query_options::{
    DefaultQueryOptions, GcTime, NotifyOnChangeProps, QueryMeta, QueryOptions, RefetchPolicy,
    ResultProp, StaleTime,
};
pub use query_state::{FetchStatus, QueryState, QueryStatus};
pub use retry::{RetryDelay, RetryPolicy};

pub mod retry;

/// Convenience trait for query value requirements.
///
/// Cached values are cloned into observers, compared for structural sharing
/// and notification suppression, and logged on failure paths.
pub trait QueryValue: Clone + PartialEq + std::fmt::Debug + 'static {}
impl<V> QueryValue for V where V: Clone + PartialEq + std::fmt::Debug + 'static {}
