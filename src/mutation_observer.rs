//! Mutation observers.
//!
//! A mutation observer is the consumer-facing handle: every
//! [`mutate`](MutationObserver::mutate) call submits a fresh
//! [`Mutation`](crate::mutation::Mutation) into the cache. Under the default
//! `Single` scope, calls issued while one is pending queue FIFO; under
//! `Parallel` they overlap and the observer's state tracks the most
//! recently submitted call, while `on_settled` still fires once per call.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures_channel::oneshot;
use slotmap::SlotMap;

use crate::mutation::Mutation;
use crate::query_observer::ListenerKey;
use crate::{MutationOptions, MutationScope, MutationState, QueryClient, QueryError};

type StateListener<D, Vars, Ctx> = Rc<dyn Fn(&MutationState<D, Vars, Ctx>)>;

/// Consumer-facing mutation handle.
pub struct MutationObserver<D, Vars, Ctx = ()>
where
    D: Clone + 'static,
    Vars: Clone + 'static,
    Ctx: Clone + 'static,
{
    client: QueryClient,
    options: MutationOptions<D, Vars, Ctx>,
    current: RefCell<Option<Mutation<D, Vars, Ctx>>>,
    queue: RefCell<VecDeque<(Vars, oneshot::Sender<Result<D, QueryError>>)>>,
    listeners: RefCell<SlotMap<ListenerKey, StateListener<D, Vars, Ctx>>>,
}

impl<D, Vars, Ctx> MutationObserver<D, Vars, Ctx>
where
    D: Clone + 'static,
    Vars: Clone + 'static,
    Ctx: Clone + 'static,
{
    /// Creates an observer. Nothing runs until the first `mutate`.
    pub fn new(client: &QueryClient, options: MutationOptions<D, Vars, Ctx>) -> Rc<Self> {
        Rc::new(MutationObserver {
            client: client.clone(),
            options,
            current: RefCell::new(None),
            queue: RefCell::new(VecDeque::new()),
            listeners: RefCell::new(SlotMap::with_key()),
        })
    }

    /// Submits a mutation. The returned future resolves with the terminal
    /// result after `on_settled` has run for this call.
    pub fn mutate(self: &Rc<Self>, vars: Vars) -> LocalBoxFuture<'static, Result<D, QueryError>> {
        let pending = self
            .current
            .borrow()
            .as_ref()
            .map_or(false, |mutation| mutation.state().is_pending());

        if self.options.scope == MutationScope::Single && pending {
            let (tx, rx) = oneshot::channel();
            self.queue.borrow_mut().push_back((vars, tx));
            return Box::pin(async move {
                rx.await.unwrap_or_else(|_| Err(QueryError::cancelled()))
            });
        }

        self.start(vars)
    }

    /// State of the most recently submitted call; idle before the first.
    pub fn current_state(&self) -> MutationState<D, Vars, Ctx> {
        self.current
            .borrow()
            .as_ref()
            .map(|mutation| mutation.state())
            .unwrap_or_default()
    }

    /// Registers a state listener.
    pub fn listen(&self, listener: impl Fn(&MutationState<D, Vars, Ctx>) + 'static) -> ListenerKey {
        self.listeners.borrow_mut().insert(Rc::new(listener))
    }

    /// Removes a state listener.
    pub fn unlisten(&self, key: ListenerKey) {
        self.listeners.borrow_mut().remove(key);
    }

    /// Returns the observer to idle. Rejected while a mutation is pending.
    pub fn reset(&self) -> Result<(), QueryError> {
        match self.current.borrow().as_ref() {
            None => Ok(()),
            Some(mutation) => mutation.reset(),
        }
    }

    fn start(self: &Rc<Self>, vars: Vars) -> LocalBoxFuture<'static, Result<D, QueryError>> {
        let resolved = self
            .options
            .clone()
            .resolve(&self.client.default_mutation_options());
        let mutation = self.client.mutation_cache().build(resolved);

        // Forward state changes only while this submission is the latest;
        // an overlapping parallel call takes the observer over.
        let weak = Rc::downgrade(self);
        let id = mutation.id();
        mutation.add_listener(Rc::new(move |state| {
            if let Some(this) = weak.upgrade() {
                let is_current = this
                    .current
                    .borrow()
                    .as_ref()
                    .map_or(false, |current| current.id() == id);
                if is_current {
                    this.notify(state);
                }
            }
        }));

        *self.current.borrow_mut() = Some(mutation.clone());

        // Synchronous pending transition: a second `mutate` issued right
        // after this one already sees it and queues.
        let fut = mutation.execute(vars);

        let (tx, rx) = oneshot::channel();
        let weak = Rc::downgrade(self);
        crate::time::spawn_local(async move {
            let result = fut.await;
            let _ = tx.send(result);
            if let Some(this) = weak.upgrade() {
                this.drain_queue();
            }
        });

        Box::pin(async move { rx.await.unwrap_or_else(|_| Err(QueryError::cancelled())) })
    }

    fn drain_queue(self: &Rc<Self>) {
        let next = self.queue.borrow_mut().pop_front();
        if let Some((vars, tx)) = next {
            let fut = self.start(vars);
            crate::time::spawn_local(async move {
                let _ = tx.send(fut.await);
            });
        }
    }

    fn notify(&self, state: &MutationState<D, Vars, Ctx>) {
        let listeners: Vec<StateListener<D, Vars, Ctx>> =
            self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(state);
        }
    }
}
