//! The client: entry point over both caches.
//!
//! A [`QueryClient`] owns the query cache, the mutation cache, the option
//! defaults, and the focus/online managers. Fleet operations select their
//! targets through [`QueryFilters`] and act on every match. Clients are
//! independent of each other; cloning a client shares everything.

use std::future::Future;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::query::{FetchConfig, QueryFnContext};
use crate::query_cache::CacheEntry;
use crate::query_observer::box_fetcher;
use crate::{
    DefaultMutationOptions, DefaultQueryOptions, FocusManager, InfiniteFnContext,
    InfiniteQueryObserver, InfiniteQueryOptions, Instant, MutationCache, MutationCacheConfig,
    MutationObserver, MutationOptions, OnlineManager, QueryCache, QueryError, QueryFilters,
    QueryKey, QueryObserver, QueryOptions, QueryState, QueryValue, RefetchType,
};

/// Client-wide option defaults.
#[derive(Clone, Debug, Default)]
pub struct DefaultOptions {
    /// Defaults applied to query observers.
    pub query: DefaultQueryOptions,
    /// Defaults applied to mutation observers.
    pub mutation: DefaultMutationOptions,
}

struct ClientInner {
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    defaults: std::cell::RefCell<DefaultOptions>,
    focus: FocusManager,
    online: OnlineManager,
}

/// Entry point of the cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Rc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// A client with default options and no mutation hooks.
    pub fn new() -> Self {
        Self::with_config(DefaultOptions::default(), MutationCacheConfig::default())
    }

    /// A client with explicit defaults.
    pub fn with_defaults(defaults: DefaultOptions) -> Self {
        Self::with_config(defaults, MutationCacheConfig::default())
    }

    /// A client with explicit defaults and mutation-cache hooks.
    pub fn with_config(defaults: DefaultOptions, mutation_config: MutationCacheConfig) -> Self {
        let online = OnlineManager::new();
        QueryClient {
            inner: Rc::new(ClientInner {
                query_cache: QueryCache::new(online.clone()),
                mutation_cache: MutationCache::new(mutation_config),
                defaults: std::cell::RefCell::new(defaults),
                focus: FocusManager::new(),
                online,
            }),
        }
    }

    /// The query cache.
    pub fn query_cache(&self) -> QueryCache {
        self.inner.query_cache.clone()
    }

    /// The mutation cache.
    pub fn mutation_cache(&self) -> MutationCache {
        self.inner.mutation_cache.clone()
    }

    /// The focus subject the host plumbs window events into.
    pub fn focus_manager(&self) -> FocusManager {
        self.inner.focus.clone()
    }

    /// The connectivity subject the host plumbs network events into.
    pub fn online_manager(&self) -> OnlineManager {
        self.inner.online.clone()
    }

    /// Current query defaults.
    pub fn default_query_options(&self) -> DefaultQueryOptions {
        self.inner.defaults.borrow().query.clone()
    }

    /// Current mutation defaults.
    pub fn default_mutation_options(&self) -> DefaultMutationOptions {
        self.inner.defaults.borrow().mutation.clone()
    }

    /// Replaces the defaults. Affects observers resolved afterwards.
    pub fn set_default_options(&self, defaults: DefaultOptions) {
        *self.inner.defaults.borrow_mut() = defaults;
    }

    /// Builds and mounts a query observer.
    pub fn watch_query<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions<V>,
    ) -> Rc<QueryObserver<V>>
    where
        V: QueryValue,
        F: Fn(QueryFnContext) -> Fut + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        QueryObserver::new(self, key.into(), fetcher, options)
    }

    /// Builds and mounts an infinite-query observer.
    pub fn watch_infinite_query<T, P, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        page_fetcher: F,
        options: InfiniteQueryOptions<T, P>,
    ) -> Rc<InfiniteQueryObserver<T, P>>
    where
        T: QueryValue,
        P: QueryValue,
        F: Fn(InfiniteFnContext<P>) -> Fut + 'static,
        Fut: Future<Output = Result<T, QueryError>> + 'static,
    {
        InfiniteQueryObserver::new(self, key.into(), page_fetcher, options)
    }

    /// Builds a mutation observer.
    pub fn watch_mutation<D, Vars, Ctx>(
        &self,
        options: MutationOptions<D, Vars, Ctx>,
    ) -> Rc<MutationObserver<D, Vars, Ctx>>
    where
        D: Clone + 'static,
        Vars: Clone + 'static,
        Ctx: Clone + 'static,
    {
        MutationObserver::new(self, options)
    }

    /// Reads cached data without subscribing.
    pub fn get_query_data<V: QueryValue>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<V>, QueryError> {
        let key = key.into();
        Ok(self
            .inner
            .query_cache
            .get::<V>(&key)?
            .and_then(|query| query.with_state(|state| state.data.clone())))
    }

    /// Reads the full cached state without subscribing.
    pub fn get_query_state<V: QueryValue>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<QueryState<V>>, QueryError> {
        let key = key.into();
        Ok(self
            .inner
            .query_cache
            .get::<V>(&key)?
            .map(|query| query.state()))
    }

    /// Writes query data atomically and returns the previous value.
    ///
    /// The updater sees the current data and may bail by returning `None`;
    /// with no existing entry, bailing also skips entry creation (so a
    /// conditional update never pollutes the cache). A write stamped older
    /// than the current data is rejected.
    pub fn set_query_data<V: QueryValue>(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&V>) -> Option<V>,
        updated_at: Option<Instant>,
    ) -> Result<Option<V>, QueryError> {
        let key = key.into();
        if let Some(query) = self.inner.query_cache.get::<V>(&key)? {
            return Ok(query.set_data(updater, updated_at));
        }

        // No entry yet: only create one when the updater produces a value.
        match updater(None) {
            None => Ok(None),
            Some(value) => {
                let (query, _) = self.inner.query_cache.build::<V>(&key);
                query.set_data(move |_| Some(value), updated_at);
                query.enable_gc_if_idle(self.default_query_options().gc_time);
                Ok(None)
            }
        }
    }

    /// Marks matching queries invalidated, then refetches per
    /// `refetch_type`. Defaults refetch active queries in the background.
    pub fn invalidate_queries(&self, filters: &QueryFilters, refetch_type: RefetchType) {
        for entry in self.inner.query_cache.find_all(filters) {
            entry.mark_invalidated_entry();
            let refetch = match refetch_type {
                RefetchType::Active => entry.is_active_entry(),
                RefetchType::Inactive => !entry.is_active_entry(),
                RefetchType::All => true,
                RefetchType::None => false,
            };
            if refetch {
                entry.execute_entry();
            }
        }
    }

    /// Forces a background fetch on every match, bypassing staleness.
    pub fn refetch_queries(&self, filters: &QueryFilters) {
        for entry in self.inner.query_cache.find_all(filters) {
            entry.execute_entry();
        }
    }

    /// Aborts in-flight fetches on every match. Returns how many were
    /// cancelled.
    pub fn cancel_queries(&self, filters: &QueryFilters) -> usize {
        self.inner
            .query_cache
            .find_all(filters)
            .iter()
            .filter(|entry| entry.cancel_entry())
            .count()
    }

    /// Returns matching queries to their initial pending state.
    pub fn reset_queries(&self, filters: &QueryFilters) {
        for entry in self.inner.query_cache.find_all(filters) {
            entry.reset_entry();
        }
    }

    /// Disposes every matching entry.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        for entry in self.inner.query_cache.find_all(filters) {
            self.inner.query_cache.remove(entry.entry_key());
        }
    }

    /// Number of matching queries with a fetch in flight.
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        self.inner
            .query_cache
            .summaries(filters)
            .iter()
            .filter(|summary| summary.is_fetching)
            .count()
    }

    /// Drops both caches, aborting all in-flight work.
    pub fn clear(&self) {
        self.inner.query_cache.clear();
        self.inner.mutation_cache.clear();
    }

    /// Imperative fetch-or-reuse: returns cached data when it is fresh
    /// under `options.stale_time`, else fetches and caches.
    pub async fn fetch_query<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions<V>,
    ) -> Result<V, QueryError>
    where
        V: QueryValue,
        F: Fn(QueryFnContext) -> Fut + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        let key = key.into();
        let defaults = self.default_query_options();
        let stale_time = options.stale_time.unwrap_or(defaults.stale_time);
        let gc_time = options.gc_time.unwrap_or(defaults.gc_time);

        let (query, _created) = self.inner.query_cache.build::<V>(&key);

        let state = query.state();
        if !state.is_stale(stale_time) {
            if let Some(data) = state.data {
                return Ok(data);
            }
        }

        let config = FetchConfig {
            fetcher: box_fetcher(fetcher),
            retry: options.retry.unwrap_or_else(|| defaults.retry.clone()),
            retry_delay: options
                .retry_delay
                .unwrap_or_else(|| defaults.retry_delay.clone()),
            meta: options.meta.clone(),
            structural_sharing: options
                .structural_sharing
                .unwrap_or(defaults.structural_sharing),
        };

        let result = query.fetch_with(config, true).await;
        query.enable_gc_if_idle(gc_time);
        result
    }

    /// Like [`fetch_query`](Self::fetch_query), discarding result and
    /// errors.
    pub async fn prefetch_query<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions<V>,
    ) where
        V: QueryValue,
        F: Fn(QueryFnContext) -> Fut + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        let key = key.into();
        if let Err(error) = self.fetch_query(key.clone(), fetcher, options).await {
            tracing::debug!(key = %key, %error, "prefetch failed");
        }
    }

    /// Returns cached data when any exists, else fetches.
    pub async fn ensure_query_data<V, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions<V>,
    ) -> Result<V, QueryError>
    where
        V: QueryValue,
        F: Fn(QueryFnContext) -> Fut + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        let key = key.into();
        if let Some(data) = self.get_query_data::<V>(key.clone())? {
            return Ok(data);
        }
        self.fetch_query(key, fetcher, options).await
    }

    /// Binds a fetcher and option template to a typed handle over one key
    /// family.
    pub fn scope<V, F, Fut>(&self, fetcher: F, options: QueryOptions<V>) -> QueryScope<V>
    where
        V: QueryValue,
        F: Fn(QueryFnContext) -> Fut + Clone + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        QueryScope {
            client: self.clone(),
            fetcher: box_fetcher(fetcher),
            options,
        }
    }
}

/// A typed handle bundling one fetcher and option template, so call sites
/// only supply keys.
pub struct QueryScope<V: QueryValue> {
    client: QueryClient,
    fetcher: crate::query::QueryFetcher<V>,
    options: QueryOptions<V>,
}

impl<V: QueryValue> QueryScope<V> {
    /// Mounts an observer for one key of the family.
    pub fn watch(&self, key: impl Into<QueryKey>) -> Rc<QueryObserver<V>> {
        let fetcher = self.fetcher.clone();
        self.client
            .watch_query(key, move |context| (fetcher)(context), self.options.clone())
    }

    /// Imperative fetch for one key of the family.
    pub fn fetch(&self, key: impl Into<QueryKey>) -> LocalBoxFuture<'static, Result<V, QueryError>> {
        let client = self.client.clone();
        let fetcher = self.fetcher.clone();
        let options = self.options.clone();
        let key = key.into();
        Box::pin(async move {
            client
                .fetch_query(key, move |context| (fetcher)(context), options)
                .await
        })
    }

    /// Prefetch for one key of the family.
    pub fn prefetch(&self, key: impl Into<QueryKey>) -> LocalBoxFuture<'static, ()> {
        let client = self.client.clone();
        let fetcher = self.fetcher.clone();
        let options = self.options.clone();
        let key = key.into();
        Box::pin(async move {
            client
                .prefetch_query(key, move |context| (fetcher)(context), options)
                .await
        })
    }

    /// Invalidates one key of the family, refetching it when active.
    pub fn invalidate(&self, key: impl Into<QueryKey>) {
        self.client
            .invalidate_queries(&QueryFilters::exact(key), RefetchType::Active);
    }
}

impl<V: QueryValue> Clone for QueryScope<V> {
    fn clone(&self) -> Self {
        QueryScope {
            client: self.client.clone(),
            fetcher: self.fetcher.clone(),
            options: self.options.clone(),
        }
    }
}
