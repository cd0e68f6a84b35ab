//! One-shot mutation state machine.
//!
//! Each `mutate` call produces one [`Mutation`]: mutations are identified
//! per invocation, not shared by key. The lifecycle is strict:
//! `on_mutate` → `mutation_fn` (under the retry policy) → `on_success` or
//! `on_error` → `on_settled`, with option-level callbacks completing before
//! the mutation cache's hooks of the same phase.

use std::cell::RefCell;
use std::future::Future;
use std::pin::pin;
use std::rc::{Rc, Weak};

use futures::future::{select, Either, LocalBoxFuture};

use crate::mutation_cache::{MutationCacheInner, MutationId};
use crate::time::Timeout;
use crate::{
    AbortController, AbortSignal, GcTime, Instant, QueryError, QueryKey, QueryMeta, RetryDelay,
    RetryPolicy,
};

/// Result status of a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationStatus {
    /// Not yet submitted (or reset).
    Idle,
    /// Submitted and not yet settled.
    Pending,
    /// Settled successfully.
    Success,
    /// Settled with an error.
    Error,
}

/// Snapshot of a mutation at one point in time.
#[derive(Clone, Debug)]
pub struct MutationState<D, Vars, Ctx> {
    /// Result status.
    pub status: MutationStatus,
    /// Result of a successful mutation.
    pub data: Option<D>,
    /// Terminal error of a failed mutation.
    pub error: Option<QueryError>,
    /// Variables of the most recent submission.
    pub variables: Option<Vars>,
    /// Value returned by `on_mutate`, carried into the later callbacks.
    pub context: Option<Ctx>,
    /// When the mutation was submitted.
    pub submitted_at: Option<Instant>,
    /// Failed attempts of the current run.
    pub failure_count: u32,
    /// Error of the most recent failed attempt.
    pub failure_reason: Option<QueryError>,
}

impl<D, Vars, Ctx> Default for MutationState<D, Vars, Ctx> {
    fn default() -> Self {
        MutationState {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            context: None,
            submitted_at: None,
            failure_count: 0,
            failure_reason: None,
        }
    }
}

impl<D, Vars, Ctx> MutationState<D, Vars, Ctx> {
    /// Not yet submitted.
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    /// Submitted and running.
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// Settled successfully.
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    /// Settled with an error.
    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

/// Context handed to a mutation function.
pub struct MutationFnContext {
    /// Abort signal; fires when the mutation cache is torn down.
    pub signal: AbortSignal,
    /// Metadata from the mutation options.
    pub meta: Option<Rc<QueryMeta>>,
}

/// Whether concurrent `mutate` calls on one observer queue or overlap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MutationScope {
    /// Calls run one at a time, FIFO.
    #[default]
    Single,
    /// Calls run concurrently; the observer tracks the most recently
    /// submitted one.
    Parallel,
}

pub(crate) type MutationFn<D, Vars> =
    Rc<dyn Fn(Vars, MutationFnContext) -> LocalBoxFuture<'static, Result<D, QueryError>>>;
type OnMutate<Vars, Ctx> = Rc<dyn Fn(&Vars) -> LocalBoxFuture<'static, Result<Ctx, QueryError>>>;
type OnSuccess<D, Vars, Ctx> = Rc<dyn Fn(&D, &Vars, Option<&Ctx>) -> Result<(), QueryError>>;
type OnError<Vars, Ctx> = Rc<dyn Fn(&QueryError, &Vars, Option<&Ctx>)>;
type OnSettled<D, Vars, Ctx> =
    Rc<dyn Fn(Option<&D>, Option<&QueryError>, &Vars, Option<&Ctx>)>;

/// Options for one mutation observer.
pub struct MutationOptions<D, Vars, Ctx = ()> {
    pub(crate) mutation_fn: MutationFn<D, Vars>,
    /// Optional key for cache filtering; carries no identity.
    pub mutation_key: Option<QueryKey>,
    pub(crate) on_mutate: Option<OnMutate<Vars, Ctx>>,
    pub(crate) on_success: Option<OnSuccess<D, Vars, Ctx>>,
    pub(crate) on_error: Option<OnError<Vars, Ctx>>,
    pub(crate) on_settled: Option<OnSettled<D, Vars, Ctx>>,
    /// Retry policy. Mutations do not retry unless asked to.
    pub retry: Option<RetryPolicy>,
    /// Pause between retry attempts.
    pub retry_delay: Option<RetryDelay>,
    /// Registry lifetime after the mutation settles.
    pub gc_time: Option<GcTime>,
    /// Queueing behavior for concurrent calls.
    pub scope: MutationScope,
    /// Metadata forwarded to the mutation function.
    pub meta: Option<Rc<QueryMeta>>,
}

impl<D, Vars, Ctx> Clone for MutationOptions<D, Vars, Ctx> {
    fn clone(&self) -> Self {
        MutationOptions {
            mutation_fn: self.mutation_fn.clone(),
            mutation_key: self.mutation_key.clone(),
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            gc_time: self.gc_time,
            scope: self.scope,
            meta: self.meta.clone(),
        }
    }
}

impl<D, Vars, Ctx: 'static> MutationOptions<D, Vars, Ctx> {
    /// Options around a mutation function.
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(Vars, MutationFnContext) -> Fut + 'static,
        Fut: Future<Output = Result<D, QueryError>> + 'static,
    {
        MutationOptions {
            mutation_fn: Rc::new(move |vars, context| {
                Box::pin(mutation_fn(vars, context)) as LocalBoxFuture<'static, _>
            }),
            mutation_key: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            retry: None,
            retry_delay: None,
            gc_time: None,
            scope: MutationScope::Single,
            meta: None,
        }
    }

    /// Sets the filtering key.
    pub fn mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    /// Runs before the mutation function; its value becomes the context of
    /// the later callbacks. An error here short-circuits to the error path
    /// with no context.
    pub fn on_mutate(mut self, f: impl Fn(&Vars) -> Result<Ctx, QueryError> + 'static) -> Self {
        self.on_mutate = Some(Rc::new(move |vars| {
            let result = f(vars);
            Box::pin(async move { result }) as LocalBoxFuture<'static, _>
        }));
        self
    }

    /// Async form of [`on_mutate`](Self::on_mutate).
    pub fn on_mutate_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&Vars) -> Fut + 'static,
        Fut: Future<Output = Result<Ctx, QueryError>> + 'static,
    {
        self.on_mutate = Some(Rc::new(move |vars| Box::pin(f(vars)) as LocalBoxFuture<'static, _>));
        self
    }

    /// Runs after a successful mutation, before `on_settled`.
    pub fn on_success(mut self, f: impl Fn(&D, &Vars, Option<&Ctx>) + 'static) -> Self {
        self.on_success = Some(Rc::new(move |data, vars, context| {
            f(data, vars, context);
            Ok(())
        }));
        self
    }

    /// Fallible form of [`on_success`](Self::on_success): an error shorts
    /// the mutation to the error state.
    pub fn on_success_fallible(
        mut self,
        f: impl Fn(&D, &Vars, Option<&Ctx>) -> Result<(), QueryError> + 'static,
    ) -> Self {
        self.on_success = Some(Rc::new(f));
        self
    }

    /// Runs after a failed mutation, before `on_settled`.
    pub fn on_error(mut self, f: impl Fn(&QueryError, &Vars, Option<&Ctx>) + 'static) -> Self {
        self.on_error = Some(Rc::new(f));
        self
    }

    /// Runs exactly once per call after success or error.
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&D>, Option<&QueryError>, &Vars, Option<&Ctx>) + 'static,
    ) -> Self {
        self.on_settled = Some(Rc::new(f));
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// Sets the registry lifetime after settling.
    pub fn gc_time(mut self, gc_time: impl Into<GcTime>) -> Self {
        self.gc_time = Some(gc_time.into());
        self
    }

    /// Sets the queueing behavior.
    pub fn scope(mut self, scope: MutationScope) -> Self {
        self.scope = scope;
        self
    }

    /// Attaches mutation metadata.
    pub fn meta(mut self, meta: QueryMeta) -> Self {
        self.meta = Some(Rc::new(meta));
        self
    }
}

/// Client-wide defaults for unset mutation options.
#[derive(Clone, Debug)]
pub struct DefaultMutationOptions {
    /// Default retry policy. Never retries out of the box.
    pub retry: RetryPolicy,
    /// Default retry delay.
    pub retry_delay: RetryDelay,
    /// Default registry lifetime after settling.
    pub gc_time: GcTime,
}

impl Default for DefaultMutationOptions {
    fn default() -> Self {
        DefaultMutationOptions {
            retry: RetryPolicy::Never,
            retry_delay: RetryDelay::default(),
            gc_time: GcTime::default(),
        }
    }
}

pub(crate) struct ResolvedMutationOptions<D, Vars, Ctx> {
    pub options: MutationOptions<D, Vars, Ctx>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub gc_time: GcTime,
}

impl<D, Vars, Ctx> MutationOptions<D, Vars, Ctx> {
    pub(crate) fn resolve(self, defaults: &DefaultMutationOptions) -> ResolvedMutationOptions<D, Vars, Ctx> {
        ResolvedMutationOptions {
            retry: self.retry.clone().unwrap_or_else(|| defaults.retry.clone()),
            retry_delay: self
                .retry_delay
                .clone()
                .unwrap_or_else(|| defaults.retry_delay.clone()),
            gc_time: self.gc_time.unwrap_or(defaults.gc_time),
            options: self,
        }
    }
}

type MutationListener<D, Vars, Ctx> = Rc<dyn Fn(&MutationState<D, Vars, Ctx>)>;

/// One submitted mutation. Cheap to clone; clones share state.
pub(crate) struct Mutation<D, Vars, Ctx> {
    id: MutationId,
    state: Rc<RefCell<MutationState<D, Vars, Ctx>>>,
    options: Rc<ResolvedMutationOptions<D, Vars, Ctx>>,
    listeners: Rc<RefCell<Vec<MutationListener<D, Vars, Ctx>>>>,
    controller: Rc<RefCell<Option<AbortController>>>,
    gc: Rc<RefCell<Option<Timeout>>>,
    cache: Weak<RefCell<MutationCacheInner>>,
}

impl<D, Vars, Ctx> Clone for Mutation<D, Vars, Ctx> {
    fn clone(&self) -> Self {
        Mutation {
            id: self.id,
            state: self.state.clone(),
            options: self.options.clone(),
            listeners: self.listeners.clone(),
            controller: self.controller.clone(),
            gc: self.gc.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<D, Vars, Ctx> Mutation<D, Vars, Ctx>
where
    D: Clone + 'static,
    Vars: Clone + 'static,
    Ctx: Clone + 'static,
{
    pub(crate) fn new(
        id: MutationId,
        options: ResolvedMutationOptions<D, Vars, Ctx>,
        cache: Weak<RefCell<MutationCacheInner>>,
    ) -> Self {
        Mutation {
            id,
            state: Rc::new(RefCell::new(MutationState::default())),
            options: Rc::new(options),
            listeners: Rc::new(RefCell::new(Vec::new())),
            controller: Rc::new(RefCell::new(None)),
            gc: Rc::new(RefCell::new(None)),
            cache,
        }
    }

    pub(crate) fn id(&self) -> MutationId {
        self.id
    }

    pub(crate) fn mutation_key(&self) -> Option<QueryKey> {
        self.options.options.mutation_key.clone()
    }

    pub(crate) fn state(&self) -> MutationState<D, Vars, Ctx> {
        self.state.borrow().clone()
    }

    pub(crate) fn status(&self) -> MutationStatus {
        self.state.borrow().status
    }

    pub(crate) fn add_listener(&self, listener: MutationListener<D, Vars, Ctx>) {
        self.listeners.borrow_mut().push(listener);
    }

    fn set_state(&self, f: impl FnOnce(&mut MutationState<D, Vars, Ctx>)) {
        let next = {
            let mut state = self.state.borrow_mut();
            f(&mut state);
            state.clone()
        };
        let listeners: Vec<MutationListener<D, Vars, Ctx>> =
            self.listeners.borrow().iter().cloned().collect();
        for listener in listeners {
            listener(&next);
        }
    }

    /// Runs the full lifecycle for one submission. Rejects synchronously
    /// when the mutation is already pending; the transition to `Pending`
    /// is also synchronous, so a caller issuing two submissions back to
    /// back observes the first one immediately.
    pub(crate) fn execute(&self, vars: Vars) -> LocalBoxFuture<'static, Result<D, QueryError>> {
        if self.status() == MutationStatus::Pending {
            return Box::pin(futures::future::ready(Err(QueryError::mutation_pending())));
        }

        self.set_state(|state| {
            *state = MutationState {
                status: MutationStatus::Pending,
                variables: Some(vars.clone()),
                submitted_at: Some(Instant::now()),
                ..MutationState::default()
            };
        });

        let this = self.clone();
        Box::pin(async move { this.run(vars).await })
    }

    /// Returns to idle. Allowed only when not pending.
    pub(crate) fn reset(&self) -> Result<(), QueryError> {
        if self.status() == MutationStatus::Pending {
            return Err(QueryError::mutation_pending());
        }
        self.set_state(|state| *state = MutationState::default());
        Ok(())
    }

    /// Aborts the in-flight mutation function, if any. Called on cache
    /// teardown.
    pub(crate) fn dispose(&self) {
        if let Some(controller) = self.controller.borrow_mut().take() {
            controller.abort(QueryError::cancelled());
        }
        self.gc.borrow_mut().take();
    }

    async fn run(&self, vars: Vars) -> Result<D, QueryError> {
        let context = match &self.options.options.on_mutate {
            None => None,
            Some(on_mutate) => match on_mutate(&vars).await {
                Ok(context) => {
                    self.set_state(|state| state.context = Some(context.clone()));
                    Some(context)
                }
                Err(error) => {
                    tracing::debug!(%error, "on_mutate failed, skipping mutation function");
                    return self.settle_error(error, &vars, None);
                }
            },
        };

        let controller = AbortController::new();
        let signal = controller.signal();
        *self.controller.borrow_mut() = Some(controller);

        let result = self.attempts(vars.clone(), &signal).await;
        self.controller.borrow_mut().take();

        match result {
            Ok(data) => {
                self.set_state(|state| {
                    state.status = MutationStatus::Success;
                    state.data = Some(data.clone());
                });

                if let Some(on_success) = &self.options.options.on_success {
                    if let Err(error) = on_success(&data, &vars, context.as_ref()) {
                        tracing::warn!(%error, "on_success failed, settling as error");
                        return self.settle_error(error, &vars, context.as_ref());
                    }
                }
                self.cache_hook(|config| config.on_success.clone(), None);

                if let Some(on_settled) = &self.options.options.on_settled {
                    on_settled(Some(&data), None, &vars, context.as_ref());
                }
                self.cache_hook(|config| config.on_settled.clone(), None);

                self.arm_gc();
                Ok(data)
            }
            Err(error) => self.settle_error(error, &vars, context.as_ref()),
        }
    }

    fn settle_error(
        &self,
        error: QueryError,
        vars: &Vars,
        context: Option<&Ctx>,
    ) -> Result<D, QueryError> {
        self.set_state(|state| {
            state.status = MutationStatus::Error;
            state.error = Some(error.clone());
        });

        if let Some(on_error) = &self.options.options.on_error {
            on_error(&error, vars, context);
        }
        self.cache_hook(|config| config.on_error.clone(), Some(error.clone()));

        if let Some(on_settled) = &self.options.options.on_settled {
            on_settled(None, Some(&error), vars, context);
        }
        self.cache_hook(|config| config.on_settled.clone(), Some(error.clone()));

        self.arm_gc();
        Err(error)
    }

    async fn attempts(&self, vars: Vars, signal: &AbortSignal) -> Result<D, QueryError> {
        let mut attempt: u32 = 0;

        loop {
            let context = MutationFnContext {
                signal: signal.clone(),
                meta: self.options.options.meta.clone(),
            };
            let fut = pin!((self.options.options.mutation_fn)(vars.clone(), context));
            let aborted = pin!(signal.aborted());

            let error = match select(fut, aborted).await {
                Either::Right(_) => return Err(QueryError::cancelled()),
                Either::Left((Ok(data), _)) => return Ok(data),
                Either::Left((Err(error), _)) => error,
            };

            self.set_state(|state| {
                state.failure_count += 1;
                state.failure_reason = Some(error.clone());
            });
            let failure_count = self.state.borrow().failure_count;

            if self.options.retry.should_retry(failure_count, &error) {
                let delay = self.options.retry_delay.delay_for(attempt);
                tracing::debug!(
                    failure_count,
                    delay_ms = delay.as_millis() as u64,
                    "retrying mutation"
                );
                let sleep = pin!(crate::time::sleep(delay));
                let aborted = pin!(signal.aborted());
                if let Either::Right(_) = select(sleep, aborted).await {
                    return Err(QueryError::cancelled());
                }
                attempt += 1;
            } else {
                return Err(error);
            }
        }
    }

    fn cache_hook(
        &self,
        pick: impl FnOnce(&crate::MutationCacheConfig) -> Option<Rc<dyn Fn(&crate::MutationEvent)>>,
        error: Option<QueryError>,
    ) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let hook = {
            let cache = cache.borrow();
            pick(cache.config())
        };
        if let Some(hook) = hook {
            hook(&crate::MutationEvent {
                mutation_key: self.mutation_key(),
                error,
            });
        }
    }

    /// Settled mutations leave the registry after their gc time.
    fn arm_gc(&self) {
        let GcTime::After(duration) = self.options.gc_time else {
            return;
        };
        let id = self.id;
        let cache = self.cache.clone();
        let timeout = Timeout::new(duration, move || {
            if let Some(cache) = cache.upgrade() {
                crate::mutation_cache::remove_settled(&cache, id);
            }
        });
        *self.gc.borrow_mut() = Some(timeout);
    }
}
