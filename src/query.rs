//! Per-key query state machine.
//!
//! A [`Query`] owns the state for one cache key and is the single point of
//! fetch execution: concurrent fetch calls share one in-flight future, the
//! retry scheduler runs here, and cancellation rolls the state back to the
//! snapshot taken when the fetch began. Observers subscribe for state
//! broadcasts but are only held weakly; the cache owns the query itself.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::pin::pin;
use std::rc::{Rc, Weak};

use futures::future::{select, Either, FutureExt, LocalBoxFuture, Shared};
use futures_channel::oneshot;

use crate::garbage_collector::GarbageCollector;
use crate::query_cache::{self, CacheInner};
use crate::query_observer::ObserverId;
use crate::{
    AbortController, AbortSignal, GcTime, Instant, OnlineManager, QueryError, QueryKey, QueryMeta,
    QueryState, QueryValue, RetryDelay, RetryPolicy, StaleTime,
};

/// Context handed to a query fetcher.
pub struct QueryFnContext {
    /// Key of the query being fetched.
    pub key: QueryKey,
    /// Cancellation signal; aborts when the fetch is cancelled or
    /// superseded.
    pub signal: AbortSignal,
    /// Metadata from the observer options.
    pub meta: Option<Rc<QueryMeta>>,
}

pub(crate) type QueryFetcher<V> =
    Rc<dyn Fn(QueryFnContext) -> LocalBoxFuture<'static, Result<V, QueryError>>>;

/// Everything a fetch execution needs, resolved from the options of whoever
/// requested it. The most recent config sticks to the query so invalidation
/// can refetch without an observer in the call stack.
pub(crate) struct FetchConfig<V> {
    pub fetcher: QueryFetcher<V>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub meta: Option<Rc<QueryMeta>>,
    pub structural_sharing: bool,
}

impl<V> Clone for FetchConfig<V> {
    fn clone(&self) -> Self {
        FetchConfig {
            fetcher: self.fetcher.clone(),
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            meta: self.meta.clone(),
            structural_sharing: self.structural_sharing,
        }
    }
}

/// Interface a query uses to talk back to its subscribed observers.
pub(crate) trait QuerySubscriber<V> {
    fn on_state_change(&self, state: &QueryState<V>);
    fn stale_time(&self) -> StaleTime;
    fn gc_time(&self) -> GcTime;
    fn is_enabled(&self) -> bool;
}

type SharedFetch<V> = Shared<LocalBoxFuture<'static, Result<V, QueryError>>>;

struct ActiveFetch<V> {
    done: SharedFetch<V>,
    controller: AbortController,
    // State as of the moment the fetch began; cancellation restores it.
    snapshot: QueryState<V>,
    epoch: u64,
}

/// A cached query. Cheap to clone; clones share state.
pub(crate) struct Query<V> {
    key: QueryKey,
    state: Rc<RefCell<QueryState<V>>>,
    config: Rc<RefCell<Option<FetchConfig<V>>>>,
    observers: Rc<RefCell<BTreeMap<ObserverId, Weak<dyn QuerySubscriber<V>>>>>,
    active: Rc<RefCell<Option<ActiveFetch<V>>>>,
    epoch: Rc<Cell<u64>>,
    refetch_queued: Rc<Cell<bool>>,
    gc: Rc<RefCell<Option<GarbageCollector>>>,
    cache: Weak<RefCell<CacheInner>>,
    online: OnlineManager,
}

impl<V> Clone for Query<V> {
    fn clone(&self) -> Self {
        Query {
            key: self.key.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            observers: self.observers.clone(),
            active: self.active.clone(),
            epoch: self.epoch.clone(),
            refetch_queued: self.refetch_queued.clone(),
            gc: self.gc.clone(),
            cache: self.cache.clone(),
            online: self.online.clone(),
        }
    }
}

impl<V: QueryValue> Query<V> {
    pub(crate) fn new(
        key: QueryKey,
        cache: Weak<RefCell<CacheInner>>,
        online: OnlineManager,
    ) -> Self {
        let query = Query {
            key: key.clone(),
            state: Rc::new(RefCell::new(QueryState::initial())),
            config: Rc::new(RefCell::new(None)),
            observers: Rc::new(RefCell::new(BTreeMap::new())),
            active: Rc::new(RefCell::new(None)),
            epoch: Rc::new(Cell::new(0)),
            refetch_queued: Rc::new(Cell::new(false)),
            gc: Rc::new(RefCell::new(None)),
            cache: cache.clone(),
            online,
        };
        *query.gc.borrow_mut() = Some(GarbageCollector::new(key, cache));
        query
    }

    pub(crate) fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Weak handle to the live state cell, for fetchers that need to read
    /// the latest data at execution time without keeping the query alive.
    pub(crate) fn state_weak(&self) -> Weak<RefCell<QueryState<V>>> {
        Rc::downgrade(&self.state)
    }

    pub(crate) fn state(&self) -> QueryState<V> {
        self.state.borrow().clone()
    }

    /// Read the state without cloning it.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&QueryState<V>) -> T) -> T {
        f(&self.state.borrow())
    }

    /// Swaps in a new state and broadcasts it: observers first, in
    /// subscription order, then the cache event stream.
    pub(crate) fn set_state(&self, next: QueryState<V>) {
        *self.state.borrow_mut() = next.clone();

        let subscribers: Vec<Rc<dyn QuerySubscriber<V>>> = {
            let mut observers = self.observers.borrow_mut();
            observers.retain(|_, weak| weak.strong_count() > 0);
            observers.values().filter_map(Weak::upgrade).collect()
        };
        for subscriber in subscribers {
            subscriber.on_state_change(&next);
        }

        if let Some(cache) = self.cache.upgrade() {
            query_cache::emit_updated(&cache, &self.key);
        }
    }

    fn update_state(&self, f: impl FnOnce(QueryState<V>) -> QueryState<V>) {
        let next = f(self.state());
        self.set_state(next);
    }

    pub(crate) fn install_config(&self, config: FetchConfig<V>) {
        *self.config.borrow_mut() = Some(config);
    }

    pub(crate) fn has_config(&self) -> bool {
        self.config.borrow().is_some()
    }

    /// Begins a fetch unless one is in flight; a concurrent call gets the
    /// in-flight fetch's future.
    pub(crate) fn fetch(&self) -> LocalBoxFuture<'static, Result<V, QueryError>> {
        if let Some(active) = self.active.borrow().as_ref() {
            return Box::pin(active.done.clone());
        }
        let config = self.config.borrow().clone();
        match config {
            Some(config) => self.start_fetch(config),
            None => {
                let error = QueryError::missing_fetcher(&self.key);
                Box::pin(futures::future::ready(Err(error)))
            }
        }
    }

    /// Like [`fetch`](Self::fetch), with an explicit config. When `install`
    /// is set the config also becomes the query's stored config for later
    /// background refetches.
    pub(crate) fn fetch_with(
        &self,
        config: FetchConfig<V>,
        install: bool,
    ) -> LocalBoxFuture<'static, Result<V, QueryError>> {
        if install {
            self.install_config(config.clone());
        }
        if let Some(active) = self.active.borrow().as_ref() {
            return Box::pin(active.done.clone());
        }
        self.start_fetch(config)
    }

    fn start_fetch(&self, config: FetchConfig<V>) -> LocalBoxFuture<'static, Result<V, QueryError>> {
        let controller = AbortController::new();
        let signal = controller.signal();
        let (tx, rx) = oneshot::channel::<Result<V, QueryError>>();

        let done: SharedFetch<V> = (Box::pin(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(QueryError::cancelled()),
            }
        }) as LocalBoxFuture<'static, Result<V, QueryError>>)
            .shared();

        let epoch = self.epoch.get() + 1;
        self.epoch.set(epoch);
        let snapshot = self.state();
        *self.active.borrow_mut() = Some(ActiveFetch {
            done: done.clone(),
            controller,
            snapshot: snapshot.clone(),
            epoch,
        });

        // Synchronous transition: callers observe `fetching` (and dedup)
        // the moment this returns.
        self.set_state(snapshot.fetch_started());

        crate::time::spawn_local(run_fetch(self.clone(), config, signal, tx, epoch));
        Box::pin(done)
    }

    /// Background refetch: starts a fetch with the stored config and drops
    /// the handle. No-op when no config has ever been installed.
    pub(crate) fn execute(&self) {
        if self.has_config() {
            drop(self.fetch());
        } else {
            tracing::debug!(key = %self.key, "refetch skipped, no fetcher installed");
        }
    }

    /// Aborts the in-flight fetch, if any, and atomically restores the
    /// snapshot taken when that fetch began. By the time this returns the
    /// rollback is visible.
    pub(crate) fn cancel(&self) -> bool {
        let taken = self.active.borrow_mut().take();
        if let Some(active) = taken {
            active.controller.abort(QueryError::cancelled());
            tracing::trace!(key = %self.key, "fetch cancelled, restoring snapshot");
            self.set_state(active.snapshot);
            true
        } else {
            false
        }
    }

    /// Marks the query invalidated without deciding about a refetch.
    /// Invalidation during an in-flight fetch coalesces into at most one
    /// follow-up fetch regardless of how often it is repeated.
    pub(crate) fn mark_invalidated(&self) {
        self.update_state(|state| state.invalidated());
        if self.active.borrow().is_some() {
            self.refetch_queued.set(true);
        }
    }

    /// Manual write. Returns the previous data; the write itself is dropped
    /// when the updater bails or an existing write is newer.
    pub(crate) fn set_data(
        &self,
        updater: impl FnOnce(Option<&V>) -> Option<V>,
        updated_at: Option<Instant>,
    ) -> Option<V> {
        let previous = self.with_state(|state| state.data.clone());
        let Some(next_data) = updater(previous.as_ref()) else {
            return previous;
        };

        let structural = self
            .config
            .borrow()
            .as_ref()
            .map_or(true, |config| config.structural_sharing);
        let at = updated_at.unwrap_or_else(Instant::now);

        if let Some(next) = self.state().data_set(next_data, at, structural) {
            self.set_state(next);
        } else {
            tracing::trace!(key = %self.key, "stale write rejected");
        }
        previous
    }

    /// Cancels in-flight work and returns to the initial pending state.
    pub(crate) fn reset(&self) {
        self.cancel();
        self.refetch_queued.set(false);
        self.set_state(QueryState::initial());
    }

    pub(crate) fn subscribe(&self, id: ObserverId, subscriber: Weak<dyn QuerySubscriber<V>>) {
        let gc_time = subscriber
            .upgrade()
            .map(|subscriber| subscriber.gc_time());
        self.observers.borrow_mut().insert(id, subscriber);

        if let Some(gc) = self.gc.borrow().as_ref() {
            gc.disable();
            if let Some(gc_time) = gc_time {
                gc.update_gc_time(gc_time);
            }
        }
    }

    pub(crate) fn unsubscribe(&self, id: ObserverId) {
        let empty = {
            let mut observers = self.observers.borrow_mut();
            observers.remove(&id);
            observers.retain(|_, weak| weak.strong_count() > 0);
            observers.is_empty()
        };

        if empty {
            if let Some(gc) = self.gc.borrow().as_ref() {
                gc.enable();
            }
        }
    }

    pub(crate) fn observer_count(&self) -> usize {
        let mut observers = self.observers.borrow_mut();
        observers.retain(|_, weak| weak.strong_count() > 0);
        observers.len()
    }

    pub(crate) fn has_enabled_observers(&self) -> bool {
        self.observers
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .any(|subscriber| subscriber.is_enabled())
    }

    /// Entry-level staleness: judged by the most impatient enabled observer,
    /// or an immediately-stale policy when nobody is watching.
    pub(crate) fn is_stale_entry(&self) -> bool {
        let stale_time = self.min_observer_stale_time();
        self.with_state(|state| state.is_stale(stale_time))
    }

    fn min_observer_stale_time(&self) -> StaleTime {
        let observers = self.observers.borrow();
        let mut min: Option<StaleTime> = None;
        for subscriber in observers.values().filter_map(Weak::upgrade) {
            if !subscriber.is_enabled() {
                continue;
            }
            let candidate = subscriber.stale_time();
            min = Some(match (min, candidate) {
                (None, candidate) => candidate,
                (Some(StaleTime::After(a)), StaleTime::After(b)) => StaleTime::After(a.min(b)),
                (Some(StaleTime::After(a)), _) => StaleTime::After(a),
                (Some(_), StaleTime::After(b)) => StaleTime::After(b),
                (Some(StaleTime::Infinite), _) | (Some(StaleTime::Static), StaleTime::Infinite) => {
                    StaleTime::Infinite
                }
                (Some(StaleTime::Static), StaleTime::Static) => StaleTime::Static,
            });
        }
        min.unwrap_or_default()
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.with_state(QueryState::is_fetching)
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.with_state(|state| state.is_invalidated)
    }

    /// Arms garbage collection for an entry that never had observers, as
    /// after an imperative `fetch_query` with nobody watching.
    pub(crate) fn enable_gc_if_idle(&self, gc_time: GcTime) {
        if self.observer_count() == 0 {
            if let Some(gc) = self.gc.borrow().as_ref() {
                gc.update_gc_time(gc_time);
                gc.enable();
            }
        }
    }

    /// Tears the query down: cancels in-flight work and stops the GC timer.
    /// Called by the cache on eviction.
    pub(crate) fn dispose(&self) {
        if self.observer_count() > 0 {
            tracing::warn!(key = %self.key, "disposing query with live observers");
        }
        self.cancel();
        if let Some(gc) = self.gc.borrow().as_ref() {
            gc.disable();
        }
    }

    fn clear_active(&self, epoch: u64) {
        let mut active = self.active.borrow_mut();
        if active.as_ref().map_or(false, |a| a.epoch == epoch) {
            *active = None;
        }
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        self.epoch.get() == epoch
    }

    fn take_refetch_queued(&self) -> bool {
        self.refetch_queued.replace(false)
    }
}

enum FetchOutcome<V> {
    Success(V),
    Failure(QueryError),
    Cancelled,
}

async fn run_fetch<V: QueryValue>(
    query: Query<V>,
    config: FetchConfig<V>,
    signal: AbortSignal,
    tx: oneshot::Sender<Result<V, QueryError>>,
    epoch: u64,
) {
    let outcome = fetch_attempts(&query, &config, &signal).await;
    query.clear_active(epoch);

    match outcome {
        FetchOutcome::Success(value) => {
            if query.is_current_epoch(epoch) {
                let next = query
                    .state()
                    .fetch_succeeded(value.clone(), Instant::now(), config.structural_sharing);
                query.set_state(next);
            }
            let _ = tx.send(Ok(value));
        }
        FetchOutcome::Failure(error) => {
            if query.is_current_epoch(epoch) {
                tracing::debug!(key = %query.key(), %error, "fetch failed");
                let next = query.state().fetch_failed(error.clone(), Instant::now());
                query.set_state(next);
            }
            let _ = tx.send(Err(error));
        }
        FetchOutcome::Cancelled => {
            // `cancel` already restored the snapshot; only the waiters are
            // left to resolve.
            let _ = tx.send(Err(QueryError::cancelled()));
            return;
        }
    }

    if query.take_refetch_queued() && query.has_enabled_observers() {
        query.execute();
    }
}

async fn fetch_attempts<V: QueryValue>(
    query: &Query<V>,
    config: &FetchConfig<V>,
    signal: &AbortSignal,
) -> FetchOutcome<V> {
    let mut attempt: u32 = 0;

    loop {
        if !query.online.is_online() {
            query.update_state(QueryState::fetch_paused);
            let resume = pin!(query.online.until_online());
            let aborted = pin!(signal.aborted());
            if let Either::Right(_) = select(resume, aborted).await {
                return FetchOutcome::Cancelled;
            }
            query.update_state(QueryState::fetch_resumed);
        }

        let context = QueryFnContext {
            key: query.key.clone(),
            signal: signal.clone(),
            meta: config.meta.clone(),
        };
        let fut = pin!((config.fetcher)(context));
        let aborted = pin!(signal.aborted());

        let error = match select(fut, aborted).await {
            Either::Right(_) => return FetchOutcome::Cancelled,
            Either::Left((Ok(value), _)) => return FetchOutcome::Success(value),
            Either::Left((Err(error), _)) => {
                if signal.is_aborted() {
                    return FetchOutcome::Cancelled;
                }
                error
            }
        };

        query.update_state(|state| state.attempt_failed(error.clone()));
        let failure_count = query.with_state(|state| state.failure_count);

        if config.retry.should_retry(failure_count, &error) {
            let delay = config.retry_delay.delay_for(attempt);
            tracing::debug!(
                key = %query.key(),
                failure_count,
                delay_ms = delay.as_millis() as u64,
                "retrying fetch"
            );
            let sleep = pin!(crate::time::sleep(delay));
            let aborted = pin!(signal.aborted());
            if let Either::Right(_) = select(sleep, aborted).await {
                return FetchOutcome::Cancelled;
            }
            attempt += 1;
        } else {
            return FetchOutcome::Failure(error);
        }
    }
}
