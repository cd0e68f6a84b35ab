//! The mutation registry.
//!
//! Mutations are registered per submission under a monotonically assigned
//! id; an optional `mutation_key` exists purely for filtering. The cache
//! also carries the process-level lifecycle hooks that run after the
//! option-level callbacks of the same phase.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::mutation::{Mutation, MutationStatus, ResolvedMutationOptions};
use crate::{MutationFilters, MutationSummary, QueryError, QueryKey};

pub(crate) type MutationId = u64;

/// Erased payload handed to the cache-level mutation hooks.
#[derive(Clone, Debug)]
pub struct MutationEvent {
    /// The mutation's filtering key, when one was assigned.
    pub mutation_key: Option<QueryKey>,
    /// The terminal error, on the error and settled-with-error phases.
    pub error: Option<QueryError>,
}

type MutationHook = Rc<dyn Fn(&MutationEvent)>;

/// Process-level mutation lifecycle hooks.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    pub(crate) on_success: Option<MutationHook>,
    pub(crate) on_error: Option<MutationHook>,
    pub(crate) on_settled: Option<MutationHook>,
}

impl MutationCacheConfig {
    /// Empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook running after every successful mutation.
    pub fn on_success(mut self, hook: impl Fn(&MutationEvent) + 'static) -> Self {
        self.on_success = Some(Rc::new(hook));
        self
    }

    /// Hook running after every failed mutation. Also the sink for callback
    /// failures, which are logged here rather than corrupting state.
    pub fn on_error(mut self, hook: impl Fn(&MutationEvent) + 'static) -> Self {
        self.on_error = Some(Rc::new(hook));
        self
    }

    /// Hook running after every settled mutation.
    pub fn on_settled(mut self, hook: impl Fn(&MutationEvent) + 'static) -> Self {
        self.on_settled = Some(Rc::new(hook));
        self
    }
}

pub(crate) trait MutationEntry {
    fn summary(&self) -> MutationSummary;
    fn dispose_entry(&self);
    fn is_settled(&self) -> bool;
}

impl<D, Vars, Ctx> MutationEntry for Mutation<D, Vars, Ctx>
where
    D: Clone + 'static,
    Vars: Clone + 'static,
    Ctx: Clone + 'static,
{
    fn summary(&self) -> MutationSummary {
        MutationSummary {
            mutation_key: self.mutation_key(),
            status: self.status(),
        }
    }

    fn dispose_entry(&self) {
        self.dispose();
    }

    fn is_settled(&self) -> bool {
        matches!(self.status(), MutationStatus::Success | MutationStatus::Error)
    }
}

pub(crate) struct MutationCacheInner {
    next_id: MutationId,
    mutations: BTreeMap<MutationId, Rc<dyn MutationEntry>>,
    config: MutationCacheConfig,
}

impl MutationCacheInner {
    pub(crate) fn config(&self) -> &MutationCacheConfig {
        &self.config
    }
}

/// Registry of live mutations.
#[derive(Clone)]
pub struct MutationCache {
    inner: Rc<RefCell<MutationCacheInner>>,
}

impl MutationCache {
    pub(crate) fn new(config: MutationCacheConfig) -> Self {
        MutationCache {
            inner: Rc::new(RefCell::new(MutationCacheInner {
                next_id: 1,
                mutations: BTreeMap::new(),
                config,
            })),
        }
    }

    pub(crate) fn build<D, Vars, Ctx>(
        &self,
        options: ResolvedMutationOptions<D, Vars, Ctx>,
    ) -> Mutation<D, Vars, Ctx>
    where
        D: Clone + 'static,
        Vars: Clone + 'static,
        Ctx: Clone + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;

        let mutation = Mutation::new(id, options, Rc::downgrade(&self.inner));
        inner.mutations.insert(id, Rc::new(mutation.clone()));
        mutation
    }

    /// Summaries of matching mutations, in submission order.
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<MutationSummary> {
        let entries: Vec<Rc<dyn MutationEntry>> = {
            let inner = self.inner.borrow();
            inner.mutations.values().cloned().collect()
        };
        entries
            .iter()
            .map(|entry| entry.summary())
            .filter(|summary| filters.matches(summary))
            .collect()
    }

    /// Number of registered mutations.
    pub fn len(&self) -> usize {
        self.inner.borrow().mutations.len()
    }

    /// Returns `true` when no mutations are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().mutations.is_empty()
    }

    /// Aborts and drops every registered mutation.
    pub fn clear(&self) {
        let entries: Vec<Rc<dyn MutationEntry>> = {
            let mut inner = self.inner.borrow_mut();
            let drained: Vec<_> = std::mem::take(&mut inner.mutations).into_values().collect();
            drained
        };
        for entry in entries {
            entry.dispose_entry();
        }
    }
}

/// GC expiry: drop the entry unless it was resubmitted meanwhile.
pub(crate) fn remove_settled(inner: &Rc<RefCell<MutationCacheInner>>, id: MutationId) {
    let entry = {
        let inner = inner.borrow();
        inner.mutations.get(&id).cloned()
    };
    let Some(entry) = entry else {
        return;
    };
    if entry.is_settled() {
        tracing::trace!(mutation_id = id, "garbage collecting settled mutation");
        inner.borrow_mut().mutations.remove(&id);
    }
}
