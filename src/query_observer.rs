//! Query observers.
//!
//! An observer translates options plus a query's state into the result one
//! consumer sees, and drives the refetch policy: fetch on mount, on focus,
//! on reconnect, and on an interval. Raw data stays on the query; `select`
//! projects it per observer, and projection equality suppresses redundant
//! notifications.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::LocalBoxFuture;
use slotmap::{new_key_type, SlotMap};

use crate::query::{FetchConfig, Query, QueryFetcher, QueryFnContext, QuerySubscriber};
use crate::query_options::{NotifyOnChangeProps, ResolvedOptions, ResultProp};
use crate::time::Interval;
use crate::{
    FetchStatus, FocusSubscription, GcTime, Instant, OnlineSubscription, QueryClient, QueryError,
    QueryKey, QueryOptions, QueryState, QueryStatus, QueryValue, RefetchPolicy, StaleTime,
};

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of one observer inside a query's subscriber set. Ordered by
/// creation, which is also the broadcast order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ObserverId(u32);

pub(crate) fn next_id() -> ObserverId {
    ObserverId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

new_key_type! {
    /// Handle for removing a result listener.
    pub struct ListenerKey;
}

/// The view of a query a consumer sees.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryObserverResult<S> {
    /// Selected data, or the placeholder while the first fetch is pending.
    pub data: Option<S>,
    /// When the underlying data was last written.
    pub data_updated_at: Option<Instant>,
    /// Last terminal fetch error.
    pub error: Option<QueryError>,
    /// When the error was last written.
    pub error_updated_at: Option<Instant>,
    /// Result status. Reads `Success` while a placeholder is shown.
    pub status: QueryStatus,
    /// Activity status.
    pub fetch_status: FetchStatus,
    /// Failed attempts of the current fetch.
    pub failure_count: u32,
    /// Error of the most recent failed attempt.
    pub failure_reason: Option<QueryError>,
    /// Whether the data is stale under this observer's stale time.
    pub is_stale: bool,
    /// Whether `data` is the observer-local placeholder.
    pub is_placeholder_data: bool,
    /// Whether the query is marked invalidated.
    pub is_invalidated: bool,
}

impl<S> QueryObserverResult<S> {
    /// No data and no terminal error yet.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Data is present.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The last fetch failed with no data to fall back on.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A fetcher invocation is in flight.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// First load: fetching with nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Background refresh: fetching while data is already shown.
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    /// A wanted fetch is waiting for connectivity.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }
}

/// Watches one query and notifies listeners with derived results.
///
/// Dropping the observer detaches it: the query loses the subscription, the
/// refetch interval stops, and manager subscriptions are removed.
pub struct QueryObserver<V, S = V>
where
    V: QueryValue,
{
    id: ObserverId,
    client: QueryClient,
    key: RefCell<QueryKey>,
    query: RefCell<Option<Query<V>>>,
    options: RefCell<ResolvedOptions<V>>,
    fetcher: RefCell<QueryFetcher<V>>,
    select: Option<Rc<dyn Fn(&V) -> S>>,
    listeners: RefCell<SlotMap<ListenerKey, Rc<dyn Fn(&QueryObserverResult<S>)>>>,
    last_result: RefCell<Option<QueryObserverResult<S>>>,
    interval: RefCell<Option<Interval>>,
    focus_sub: Cell<Option<FocusSubscription>>,
    online_sub: Cell<Option<OnlineSubscription>>,
}

impl<V: QueryValue> QueryObserver<V, V> {
    /// Creates and mounts an observer whose result exposes the raw data.
    pub fn new<F, Fut>(
        client: &QueryClient,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions<V>,
    ) -> Rc<Self>
    where
        F: Fn(QueryFnContext) -> Fut + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        Self::create(client, key, box_fetcher(fetcher), options, None)
    }
}

impl<V, S> QueryObserver<V, S>
where
    V: QueryValue,
    S: Clone + PartialEq + 'static,
{
    /// Creates and mounts an observer with a `select` projection.
    pub fn with_select<F, Fut>(
        client: &QueryClient,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions<V>,
        select: impl Fn(&V) -> S + 'static,
    ) -> Rc<Self>
    where
        F: Fn(QueryFnContext) -> Fut + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        Self::create(client, key, box_fetcher(fetcher), options, Some(Rc::new(select)))
    }

    fn create(
        client: &QueryClient,
        key: QueryKey,
        fetcher: QueryFetcher<V>,
        options: QueryOptions<V>,
        select: Option<Rc<dyn Fn(&V) -> S>>,
    ) -> Rc<Self> {
        let resolved = options.resolve(&client.default_query_options());
        let observer = Rc::new(QueryObserver {
            id: next_id(),
            client: client.clone(),
            key: RefCell::new(key.clone()),
            query: RefCell::new(None),
            options: RefCell::new(resolved),
            fetcher: RefCell::new(fetcher),
            select,
            listeners: RefCell::new(SlotMap::with_key()),
            last_result: RefCell::new(None),
            interval: RefCell::new(None),
            focus_sub: Cell::new(None),
            online_sub: Cell::new(None),
        });

        observer.attach(key);
        observer.register_managers();
        observer.restart_interval();
        observer
    }

    /// The key currently observed.
    pub fn key(&self) -> QueryKey {
        self.key.borrow().clone()
    }

    pub(crate) fn query_handle(&self) -> Option<Query<V>> {
        self.query.borrow().clone()
    }

    /// The result as of the last state change.
    pub fn current_result(&self) -> QueryObserverResult<S> {
        if let Some(result) = self.last_result.borrow().as_ref() {
            return result.clone();
        }
        // Not mounted yet; derive from the live query state.
        let state = self
            .query
            .borrow()
            .as_ref()
            .map(|query| query.state())
            .unwrap_or_default();
        self.compute_result(&state, false)
    }

    /// Registers a listener for result changes, filtered by
    /// `notify_on_change_props`.
    pub fn listen(&self, listener: impl Fn(&QueryObserverResult<S>) + 'static) -> ListenerKey {
        self.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a listener.
    pub fn unlisten(&self, key: ListenerKey) {
        self.listeners.borrow_mut().remove(key);
    }

    /// Forces a fetch, bypassing staleness. Deduplicates against any fetch
    /// already in flight.
    pub fn refetch(&self) -> LocalBoxFuture<'static, Result<V, QueryError>> {
        match self.query.borrow().as_ref() {
            Some(query) => query.fetch(),
            None => Box::pin(futures::future::ready(Err(QueryError::key_not_found(
                &self.key.borrow(),
            )))),
        }
    }

    /// Re-targets the observer at a different key, rerunning mount logic.
    pub fn set_key(self: &Rc<Self>, key: QueryKey) {
        if *self.key.borrow() == key {
            return;
        }
        self.detach_query();
        *self.last_result.borrow_mut() = None;
        self.attach(key);
        self.restart_interval();
    }

    /// Applies new options: flags are recomputed, and a fetch may trigger if
    /// the query is now stale and enabled.
    pub fn set_options(self: &Rc<Self>, options: QueryOptions<V>) {
        let resolved = options.resolve(&self.client.default_query_options());
        *self.options.borrow_mut() = resolved;

        let query = self.query.borrow().clone();
        if let Some(query) = query {
            query.install_config(self.fetch_config());

            let state = query.state();
            self.publish(&state);

            let options = self.options.borrow();
            if options.enabled
                && !matches!(options.stale_time, StaleTime::Static)
                && state.is_stale(options.stale_time)
                && !state.is_fetching()
            {
                drop(options);
                query.execute();
            }
        }
        self.restart_interval();
    }

    fn attach(self: &Rc<Self>, key: QueryKey) {
        *self.key.borrow_mut() = key.clone();

        let (query, created) = self.client.query_cache().build::<V>(&key);

        if created {
            let options = self.options.borrow();
            if let Some(initial) = options.initial_data.clone() {
                let at = options.initial_data_updated_at;
                drop(options);
                query.set_data(move |_| Some(initial), at);
            }
        }

        query.install_config(self.fetch_config());

        let subscriber: Rc<dyn QuerySubscriber<V>> = self.clone();
        query.subscribe(self.id, Rc::downgrade(&subscriber));
        *self.query.borrow_mut() = Some(query.clone());

        let will_fetch = self.should_fetch_on_mount(&query);

        // The first result already shows the fetch the mount is about to
        // start, so consumers render a loading state on their first read.
        let state = query.state();
        let result = self.compute_result(&state, will_fetch);
        *self.last_result.borrow_mut() = Some(result);

        if will_fetch {
            query.execute();
        }
    }

    fn fetch_config(&self) -> FetchConfig<V> {
        let options = self.options.borrow();
        FetchConfig {
            fetcher: self.fetcher.borrow().clone(),
            retry: options.retry.clone(),
            retry_delay: options.retry_delay.clone(),
            meta: options.meta.clone(),
            structural_sharing: options.structural_sharing,
        }
    }

    fn should_fetch_on_mount(&self, query: &Query<V>) -> bool {
        let options = self.options.borrow();
        if !options.enabled {
            return false;
        }

        let state = query.state();
        if state.is_fetching() {
            return false;
        }
        // The very first load is not a refetch; only `enabled` gates it.
        if !state.has_data() {
            return true;
        }
        if matches!(options.stale_time, StaleTime::Static) {
            return false;
        }
        match options.refetch_on_mount {
            RefetchPolicy::Never => false,
            RefetchPolicy::Always => true,
            RefetchPolicy::Stale => state.is_stale(options.stale_time),
        }
    }

    fn project(&self, data: &V) -> S
    where
        S: Clone,
    {
        match &self.select {
            Some(select) => select(data),
            None => {
                // `S` defaults to `V`; without a projection the types are
                // guaranteed equal by construction.
                let any: &dyn std::any::Any = data;
                any.downcast_ref::<S>()
                    .expect("observer without select must have S = V")
                    .clone()
            }
        }
    }

    fn compute_result(&self, state: &QueryState<V>, optimistic_fetch: bool) -> QueryObserverResult<S> {
        let options = self.options.borrow();

        let mut status = state.status;
        let mut is_placeholder = false;
        let data = match &state.data {
            Some(data) => Some(self.project(data)),
            None => {
                if state.status == QueryStatus::Pending {
                    options.placeholder_data.as_ref().map(|placeholder| {
                        is_placeholder = true;
                        status = QueryStatus::Success;
                        self.project(placeholder)
                    })
                } else {
                    None
                }
            }
        };

        let fetch_status = if optimistic_fetch && state.fetch_status == FetchStatus::Idle {
            FetchStatus::Fetching
        } else {
            state.fetch_status
        };

        QueryObserverResult {
            data,
            data_updated_at: state.data_updated_at,
            error: state.error.clone(),
            error_updated_at: state.error_updated_at,
            status,
            fetch_status,
            failure_count: state.failure_count,
            failure_reason: state.failure_reason.clone(),
            is_stale: state.is_stale(options.stale_time),
            is_placeholder_data: is_placeholder,
            is_invalidated: state.is_invalidated,
        }
    }

    fn publish(&self, state: &QueryState<V>) {
        let next = self.compute_result(state, false);
        let previous = self.last_result.borrow_mut().replace(next.clone());

        let should_notify = match previous {
            None => true,
            Some(previous) => {
                let options = self.options.borrow();
                match &options.notify_on_change_props {
                    NotifyOnChangeProps::All => previous != next,
                    NotifyOnChangeProps::Props(props) => {
                        let changed = changed_props(&previous, &next);
                        props.iter().any(|prop| changed.contains(prop))
                    }
                }
            }
        };

        if should_notify {
            let listeners: Vec<Rc<dyn Fn(&QueryObserverResult<S>)>> =
                self.listeners.borrow().values().cloned().collect();
            for listener in listeners {
                listener(&next);
            }
        }
    }

    fn register_managers(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let focus_sub = self.client.focus_manager().subscribe(move |focused| {
            if focused {
                if let Some(observer) = weak.upgrade() {
                    observer.on_lifecycle_event(|options| options.refetch_on_focus);
                }
            }
        });
        self.focus_sub.set(Some(focus_sub));

        let weak = Rc::downgrade(self);
        let online_sub = self.client.online_manager().subscribe(move |online| {
            if online {
                if let Some(observer) = weak.upgrade() {
                    observer.on_lifecycle_event(|options| options.refetch_on_reconnect);
                }
            }
        });
        self.online_sub.set(Some(online_sub));
    }

    fn on_lifecycle_event(&self, policy: impl FnOnce(&ResolvedOptions<V>) -> RefetchPolicy) {
        let (enabled, stale_time, policy) = {
            let options = self.options.borrow();
            (options.enabled, options.stale_time, policy(&options))
        };
        if !enabled || matches!(stale_time, StaleTime::Static) {
            return;
        }

        let Some(query) = self.query.borrow().clone() else {
            return;
        };
        match policy {
            RefetchPolicy::Never => {}
            RefetchPolicy::Always => query.execute(),
            RefetchPolicy::Stale => {
                if query.with_state(|state| state.is_stale(stale_time)) {
                    query.execute();
                }
            }
        }
    }

    fn restart_interval(self: &Rc<Self>) {
        *self.interval.borrow_mut() = None;

        let options = self.options.borrow();
        if !options.enabled || matches!(options.stale_time, StaleTime::Static) {
            return;
        }
        let Some(period) = options.refetch_interval else {
            return;
        };
        let in_background = options.refetch_interval_in_background;
        drop(options);

        let weak = Rc::downgrade(self);
        let interval = Interval::new(period, move || {
            let Some(observer) = weak.upgrade() else {
                return;
            };
            let Some(query) = observer.query.borrow().clone() else {
                return;
            };
            if query.with_state(QueryState::is_paused) && !in_background {
                return;
            }
            query.execute();
        });
        *self.interval.borrow_mut() = Some(interval);
    }
}

impl<V, S> QueryObserver<V, S>
where
    V: QueryValue,
{
    fn detach_query(&self) {
        if let Some(query) = self.query.borrow_mut().take() {
            query.unsubscribe(self.id);
        }
    }
}

impl<V, S> QuerySubscriber<V> for QueryObserver<V, S>
where
    V: QueryValue,
    S: Clone + PartialEq + 'static,
{
    fn on_state_change(&self, state: &QueryState<V>) {
        self.publish(state);
    }

    fn stale_time(&self) -> StaleTime {
        self.options.borrow().stale_time
    }

    fn gc_time(&self) -> GcTime {
        self.options.borrow().gc_time
    }

    fn is_enabled(&self) -> bool {
        self.options.borrow().enabled
    }
}

impl<V, S> Drop for QueryObserver<V, S>
where
    V: QueryValue,
{
    fn drop(&mut self) {
        self.detach_query();
        if let Some(sub) = self.focus_sub.take() {
            self.client.focus_manager().unsubscribe(sub);
        }
        if let Some(sub) = self.online_sub.take() {
            self.client.online_manager().unsubscribe(sub);
        }
    }
}

pub(crate) fn box_fetcher<V, F, Fut>(fetcher: F) -> QueryFetcher<V>
where
    F: Fn(QueryFnContext) -> Fut + 'static,
    Fut: Future<Output = Result<V, QueryError>> + 'static,
{
    Rc::new(move |context| Box::pin(fetcher(context)) as LocalBoxFuture<'static, _>)
}

fn changed_props<S: PartialEq>(
    previous: &QueryObserverResult<S>,
    next: &QueryObserverResult<S>,
) -> Vec<ResultProp> {
    let mut changed = Vec::new();
    if previous.data != next.data {
        changed.push(ResultProp::Data);
    }
    if previous.error != next.error {
        changed.push(ResultProp::Error);
    }
    if previous.status != next.status {
        changed.push(ResultProp::Status);
    }
    if previous.fetch_status != next.fetch_status {
        changed.push(ResultProp::FetchStatus);
    }
    if previous.failure_count != next.failure_count || previous.failure_reason != next.failure_reason
    {
        changed.push(ResultProp::FailureCount);
    }
    if previous.is_stale != next.is_stale {
        changed.push(ResultProp::IsStale);
    }
    if previous.is_placeholder_data != next.is_placeholder_data {
        changed.push(ResultProp::IsPlaceholderData);
    }
    changed
}
