//! Infinite queries: ordered pages behind one cache entry.
//!
//! The cached value is an [`InfiniteData`] — pages and their page params in
//! lock-step. Page fetches and full refetches all go through the underlying
//! query's single in-flight slot, so a next-page fetch and a refetch are
//! mutually exclusive and concurrent callers join the same fetch. A full
//! refetch replays every page in order with its original param and swaps the
//! result in atomically; any page failure leaves the previous pages
//! untouched.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::future::{FutureExt, LocalBoxFuture};
use slotmap::SlotMap;

use crate::query::{FetchConfig, Query, QueryFetcher, QueryFnContext};
use crate::query_observer::{ListenerKey, QueryObserverResult};
use crate::{
    AbortSignal, QueryClient, QueryError, QueryKey, QueryMeta, QueryObserver, QueryOptions,
    QueryState, QueryValue,
};

/// Pages of an infinite query, with the param used to fetch each page.
#[derive(Clone, Debug, PartialEq)]
pub struct InfiniteData<T, P> {
    /// Fetched pages, oldest-first.
    pub pages: Vec<T>,
    /// The page param each page was fetched with. Always the same length as
    /// `pages`.
    pub page_params: Vec<P>,
}

impl<T, P> Default for InfiniteData<T, P> {
    fn default() -> Self {
        InfiniteData {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

impl<T, P> InfiniteData<T, P> {
    /// Number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` when no pages have been fetched.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn appended(mut self, page: T, param: P, max_pages: Option<usize>) -> Self {
        self.pages.push(page);
        self.page_params.push(param);
        if let Some(max) = max_pages {
            while self.pages.len() > max {
                self.pages.remove(0);
                self.page_params.remove(0);
            }
        }
        self
    }

    fn prepended(mut self, page: T, param: P, max_pages: Option<usize>) -> Self {
        self.pages.insert(0, page);
        self.page_params.insert(0, param);
        if let Some(max) = max_pages {
            while self.pages.len() > max {
                self.pages.pop();
                self.page_params.pop();
            }
        }
        self
    }
}

/// Which end of the page list a fetch extends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchDirection {
    /// Append after the last page.
    Forward,
    /// Prepend before the first page.
    Backward,
}

/// Context handed to an infinite-query page fetcher.
pub struct InfiniteFnContext<P> {
    /// Key of the query being fetched.
    pub key: QueryKey,
    /// Cancellation signal for this fetch.
    pub signal: AbortSignal,
    /// Metadata from the observer options.
    pub meta: Option<Rc<QueryMeta>>,
    /// The cursor for the page to fetch.
    pub page_param: P,
    /// Which end of the list the page extends.
    pub direction: FetchDirection,
}

type PageFetcher<T, P> = Rc<dyn Fn(InfiniteFnContext<P>) -> LocalBoxFuture<'static, Result<T, QueryError>>>;
type PageParamBuilder<T, P> = Rc<dyn Fn(&InfiniteData<T, P>) -> Option<P>>;

/// Options for an infinite query: the shared query options plus the page
/// cursor machinery.
pub struct InfiniteQueryOptions<T, P> {
    /// Options shared with plain queries.
    pub query: QueryOptions<InfiniteData<T, P>>,
    /// Cursor for the very first page.
    pub initial_page_param: P,
    /// Builds the cursor for the page after the current pages, or `None`
    /// when the list is complete.
    pub next_page_param: PageParamBuilder<T, P>,
    /// Builds the cursor for the page before the current pages. Without it
    /// backward fetches are disabled.
    pub previous_page_param: Option<PageParamBuilder<T, P>>,
    /// Upper bound on retained pages; overflow trims the end opposite the
    /// fetch direction.
    pub max_pages: Option<usize>,
}

impl<T, P> InfiniteQueryOptions<T, P> {
    /// Options with the required cursor machinery and defaults elsewhere.
    pub fn new(
        initial_page_param: P,
        next_page_param: impl Fn(&InfiniteData<T, P>) -> Option<P> + 'static,
    ) -> Self {
        InfiniteQueryOptions {
            query: QueryOptions::default(),
            initial_page_param,
            next_page_param: Rc::new(next_page_param),
            previous_page_param: None,
            max_pages: None,
        }
    }

    /// Enables backward fetching.
    pub fn previous_page_param(
        mut self,
        builder: impl Fn(&InfiniteData<T, P>) -> Option<P> + 'static,
    ) -> Self {
        self.previous_page_param = Some(Rc::new(builder));
        self
    }

    /// Bounds the number of retained pages.
    pub fn max_pages(mut self, max: usize) -> Self {
        self.max_pages = Some(max);
        self
    }

    /// Replaces the shared query options.
    pub fn query_options(mut self, options: QueryOptions<InfiniteData<T, P>>) -> Self {
        self.query = options;
        self
    }
}

/// The view of an infinite query a consumer sees.
#[derive(Clone, Debug, PartialEq)]
pub struct InfiniteQueryResult<T, P> {
    /// The shared observer result over the page list.
    pub result: QueryObserverResult<InfiniteData<T, P>>,
    /// Whether the next-page builder yields a param for the current pages.
    pub has_next_page: bool,
    /// Whether the previous-page builder yields a param.
    pub has_previous_page: bool,
    /// A next-page fetch is in flight.
    pub is_fetching_next_page: bool,
    /// A previous-page fetch is in flight.
    pub is_fetching_previous_page: bool,
}

/// Observer for an infinite query.
pub struct InfiniteQueryObserver<T, P>
where
    T: QueryValue,
    P: QueryValue,
{
    observer: Rc<QueryObserver<InfiniteData<T, P>>>,
    forward_key: Cell<Option<ListenerKey>>,
    listeners: RefCell<SlotMap<ListenerKey, Rc<dyn Fn(&InfiniteQueryResult<T, P>)>>>,
    page_fetcher: PageFetcher<T, P>,
    initial_page_param: P,
    next_page_param: PageParamBuilder<T, P>,
    previous_page_param: Option<PageParamBuilder<T, P>>,
    max_pages: Option<usize>,
    retry: crate::RetryPolicy,
    retry_delay: crate::RetryDelay,
    meta: Option<Rc<QueryMeta>>,
    structural_sharing: bool,
    is_fetching_next: Rc<Cell<bool>>,
    is_fetching_previous: Rc<Cell<bool>>,
}

impl<T, P> InfiniteQueryObserver<T, P>
where
    T: QueryValue,
    P: QueryValue,
{
    /// Creates and mounts an infinite-query observer.
    pub fn new<F, Fut>(
        client: &QueryClient,
        key: QueryKey,
        page_fetcher: F,
        options: InfiniteQueryOptions<T, P>,
    ) -> Rc<Self>
    where
        F: Fn(InfiniteFnContext<P>) -> Fut + 'static,
        Fut: Future<Output = Result<T, QueryError>> + 'static,
    {
        let page_fetcher: PageFetcher<T, P> =
            Rc::new(move |context| Box::pin(page_fetcher(context)) as LocalBoxFuture<'static, _>);

        let resolved = options.query.clone().resolve(&client.default_query_options());

        // The full-refetch fetcher needs the latest page params at execution
        // time; the query does not exist yet, so it reads through a slot
        // filled in right after the observer mounts.
        let state_slot: Rc<RefCell<Weak<RefCell<QueryState<InfiniteData<T, P>>>>>> =
            Rc::new(RefCell::new(Weak::new()));
        let refetch = refetch_fetcher(
            page_fetcher.clone(),
            options.initial_page_param.clone(),
            state_slot.clone(),
        );

        let observer = QueryObserver::new(
            client,
            key,
            move |context| (refetch)(context),
            options.query,
        );
        if let Some(query) = observer.query_handle() {
            *state_slot.borrow_mut() = query.state_weak();
        }

        let this = Rc::new(InfiniteQueryObserver {
            observer,
            forward_key: Cell::new(None),
            listeners: RefCell::new(SlotMap::with_key()),
            page_fetcher,
            initial_page_param: options.initial_page_param,
            next_page_param: options.next_page_param,
            previous_page_param: options.previous_page_param,
            max_pages: options.max_pages,
            retry: resolved.retry,
            retry_delay: resolved.retry_delay,
            meta: resolved.meta,
            structural_sharing: resolved.structural_sharing,
            is_fetching_next: Rc::new(Cell::new(false)),
            is_fetching_previous: Rc::new(Cell::new(false)),
        });

        let weak = Rc::downgrade(&this);
        let forward_key = this.observer.listen(move |result| {
            if let Some(this) = weak.upgrade() {
                let wrapped = this.wrap(result.clone());
                this.notify(&wrapped);
            }
        });
        this.forward_key.set(Some(forward_key));
        this
    }

    /// The result as of the last state change.
    pub fn current_result(&self) -> InfiniteQueryResult<T, P> {
        self.wrap(self.observer.current_result())
    }

    /// Registers a listener for result changes.
    pub fn listen(&self, listener: impl Fn(&InfiniteQueryResult<T, P>) + 'static) -> ListenerKey {
        self.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a listener.
    pub fn unlisten(&self, key: ListenerKey) {
        self.listeners.borrow_mut().remove(key);
    }

    /// Fetches the page after the last one. No-op when the builder reports
    /// no further page; joins the in-flight fetch when one is running.
    pub fn fetch_next_page(self: &Rc<Self>) -> LocalBoxFuture<'static, Result<(), QueryError>> {
        self.fetch_page(FetchDirection::Forward)
    }

    /// Fetches the page before the first one. No-op without a
    /// previous-page builder or when it reports no further page.
    pub fn fetch_previous_page(self: &Rc<Self>) -> LocalBoxFuture<'static, Result<(), QueryError>> {
        self.fetch_page(FetchDirection::Backward)
    }

    /// Forces a full refetch of every page in order.
    pub fn refetch(&self) -> LocalBoxFuture<'static, Result<(), QueryError>> {
        Box::pin(self.observer.refetch().map(|result| result.map(|_| ())))
    }

    fn fetch_page(self: &Rc<Self>, direction: FetchDirection) -> LocalBoxFuture<'static, Result<(), QueryError>> {
        let Some(query) = self.observer.query_handle() else {
            return Box::pin(futures::future::ready(Err(QueryError::key_not_found(
                &self.observer.key(),
            ))));
        };

        // A running refetch (or page fetch) owns the slot; join it.
        if query.is_fetching() {
            return Box::pin(query.fetch().map(|result| result.map(|_| ())));
        }

        let data = query
            .with_state(|state| state.data.clone())
            .unwrap_or_default();

        let param = match direction {
            // With no pages yet, extending forward is just the initial load.
            FetchDirection::Forward if data.is_empty() => Some(self.initial_page_param.clone()),
            FetchDirection::Forward => (self.next_page_param)(&data),
            FetchDirection::Backward => self
                .previous_page_param
                .as_ref()
                .and_then(|builder| builder(&data)),
        };
        let Some(param) = param else {
            return Box::pin(futures::future::ready(Ok(())));
        };

        let flag = match direction {
            FetchDirection::Forward => self.is_fetching_next.clone(),
            FetchDirection::Backward => self.is_fetching_previous.clone(),
        };
        flag.set(true);
        self.notify(&self.current_result());

        let config = self.page_config(&query, param, direction);
        let done = query.fetch_with(config, false);
        // Second handle onto the same in-flight fetch: clears the flag even
        // if the caller drops the returned future.
        let watch = query.fetch();

        let weak = Rc::downgrade(self);
        crate::time::spawn_local(async move {
            let _ = watch.await;
            if let Some(this) = weak.upgrade() {
                flag.set(false);
                this.notify(&this.current_result());
            }
        });

        Box::pin(done.map(|result| result.map(|_| ())))
    }

    fn page_config(
        &self,
        query: &Query<InfiniteData<T, P>>,
        param: P,
        direction: FetchDirection,
    ) -> FetchConfig<InfiniteData<T, P>> {
        let page_fetcher = self.page_fetcher.clone();
        let state_weak = query.state_weak();
        let max_pages = self.max_pages;

        let fetcher: QueryFetcher<InfiniteData<T, P>> = Rc::new(move |context: QueryFnContext| {
            let page_fetcher = page_fetcher.clone();
            let state_weak = state_weak.clone();
            let param = param.clone();
            Box::pin(async move {
                let current = state_weak
                    .upgrade()
                    .and_then(|state| state.borrow().data.clone())
                    .unwrap_or_default();
                let page = page_fetcher(InfiniteFnContext {
                    key: context.key,
                    signal: context.signal,
                    meta: context.meta,
                    page_param: param.clone(),
                    direction,
                })
                .await?;
                Ok(match direction {
                    FetchDirection::Forward => current.appended(page, param, max_pages),
                    FetchDirection::Backward => current.prepended(page, param, max_pages),
                })
            }) as LocalBoxFuture<'static, _>
        });

        FetchConfig {
            fetcher,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            meta: self.meta.clone(),
            structural_sharing: self.structural_sharing,
        }
    }

    fn wrap(&self, result: QueryObserverResult<InfiniteData<T, P>>) -> InfiniteQueryResult<T, P> {
        let has_next_page = result
            .data
            .as_ref()
            .map(|data| (self.next_page_param)(data).is_some())
            .unwrap_or(false);
        let has_previous_page = match (&result.data, &self.previous_page_param) {
            (Some(data), Some(builder)) => builder(data).is_some(),
            _ => false,
        };

        InfiniteQueryResult {
            result,
            has_next_page,
            has_previous_page,
            is_fetching_next_page: self.is_fetching_next.get(),
            is_fetching_previous_page: self.is_fetching_previous.get(),
        }
    }

    fn notify(&self, result: &InfiniteQueryResult<T, P>) {
        let listeners: Vec<Rc<dyn Fn(&InfiniteQueryResult<T, P>)>> =
            self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(result);
        }
    }
}

impl<T, P> Drop for InfiniteQueryObserver<T, P>
where
    T: QueryValue,
    P: QueryValue,
{
    fn drop(&mut self) {
        if let Some(key) = self.forward_key.take() {
            self.observer.unlisten(key);
        }
    }
}

fn refetch_fetcher<T, P>(
    page_fetcher: PageFetcher<T, P>,
    initial_page_param: P,
    state_slot: Rc<RefCell<Weak<RefCell<QueryState<InfiniteData<T, P>>>>>>,
) -> QueryFetcher<InfiniteData<T, P>>
where
    T: QueryValue,
    P: QueryValue,
{
    Rc::new(move |context: QueryFnContext| {
        let page_fetcher = page_fetcher.clone();
        let initial = initial_page_param.clone();
        let current = state_slot
            .borrow()
            .upgrade()
            .and_then(|state| state.borrow().data.clone())
            .unwrap_or_default();

        Box::pin(async move {
            if current.is_empty() {
                let page = page_fetcher(InfiniteFnContext {
                    key: context.key,
                    signal: context.signal,
                    meta: context.meta,
                    page_param: initial.clone(),
                    direction: FetchDirection::Forward,
                })
                .await?;
                return Ok(InfiniteData {
                    pages: vec![page],
                    page_params: vec![initial],
                });
            }

            // Replay every page with its original param, in order. Failing
            // any page fails the whole refetch and keeps the old pages.
            let mut pages = Vec::with_capacity(current.len());
            let mut page_params = Vec::with_capacity(current.len());
            for param in current.page_params {
                if context.signal.is_aborted() {
                    return Err(QueryError::cancelled());
                }
                let page = page_fetcher(InfiniteFnContext {
                    key: context.key.clone(),
                    signal: context.signal.clone(),
                    meta: context.meta.clone(),
                    page_param: param.clone(),
                    direction: FetchDirection::Forward,
                })
                .await?;
                pages.push(page);
                page_params.push(param);
            }
            Ok(InfiniteData { pages, page_params })
        }) as LocalBoxFuture<'static, _>
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_prepend_stay_in_lockstep() {
        let data = InfiniteData::<&'static str, u32>::default()
            .appended("b", 1, None)
            .appended("c", 2, None)
            .prepended("a", 0, None);

        assert_eq!(data.pages, vec!["a", "b", "c"]);
        assert_eq!(data.page_params, vec![0, 1, 2]);
    }

    #[test]
    fn max_pages_trims_opposite_end() {
        let data = InfiniteData::<&'static str, u32>::default()
            .appended("a", 0, Some(2))
            .appended("b", 1, Some(2))
            .appended("c", 2, Some(2));
        assert_eq!(data.pages, vec!["b", "c"]);
        assert_eq!(data.page_params, vec![1, 2]);

        let data = data.prepended("a", 0, Some(2));
        assert_eq!(data.pages, vec!["a", "b"]);
        assert_eq!(data.page_params, vec![0, 1]);
    }
}
