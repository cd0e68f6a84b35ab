//! The query registry.
//!
//! Entries are stored by structural key and type-erased over their value
//! type; typed access goes through a checked downcast. The cache owns its
//! queries — observers and clients only hold handles — and emits a small
//! event stream (added / updated / removed) that devtools-style consumers
//! can subscribe to.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use slotmap::{new_key_type, SlotMap};

use crate::query::Query;
use crate::{
    OnlineManager, QueryEntrySummary, QueryError, QueryFilters, QueryKey, QueryValue,
};

/// A change in the cache, observable via [`QueryCache::subscribe`].
#[derive(Clone, Debug)]
pub enum CacheEvent {
    /// An entry was created.
    Added(QueryKey),
    /// An entry's state changed.
    Updated(QueryKey),
    /// An entry was disposed.
    Removed(QueryKey),
}

new_key_type! {
    /// Handle for removing a cache-event subscription.
    pub struct CacheSubscription;
}

/// Erased operations available on any cache entry regardless of its value
/// type.
pub(crate) trait CacheEntry {
    fn as_any(&self) -> &dyn Any;
    fn entry_key(&self) -> &QueryKey;
    fn summary(&self) -> QueryEntrySummary;
    fn mark_invalidated_entry(&self);
    fn execute_entry(&self);
    fn cancel_entry(&self) -> bool;
    fn reset_entry(&self);
    fn dispose_entry(&self);
    fn observers(&self) -> usize;
    fn is_active_entry(&self) -> bool;
}

impl<V: QueryValue> CacheEntry for Query<V> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn entry_key(&self) -> &QueryKey {
        self.key()
    }

    fn summary(&self) -> QueryEntrySummary {
        QueryEntrySummary {
            key: self.key().clone(),
            is_active: self.has_enabled_observers(),
            is_stale: self.is_stale_entry(),
            is_fetching: self.is_fetching(),
            is_invalidated: self.is_invalidated(),
            observer_count: self.observer_count(),
        }
    }

    fn mark_invalidated_entry(&self) {
        self.mark_invalidated();
    }

    fn execute_entry(&self) {
        self.execute();
    }

    fn cancel_entry(&self) -> bool {
        self.cancel()
    }

    fn reset_entry(&self) {
        self.reset();
    }

    fn dispose_entry(&self) {
        self.dispose();
    }

    fn observers(&self) -> usize {
        self.observer_count()
    }

    fn is_active_entry(&self) -> bool {
        self.has_enabled_observers()
    }
}

pub(crate) struct CacheInner {
    entries: HashMap<QueryKey, Rc<dyn CacheEntry>>,
    listeners: SlotMap<CacheSubscription, Rc<dyn Fn(&CacheEvent)>>,
}

/// Registry of live queries, keyed by [`QueryKey`].
#[derive(Clone)]
pub struct QueryCache {
    inner: Rc<RefCell<CacheInner>>,
    online: OnlineManager,
}

impl QueryCache {
    pub(crate) fn new(online: OnlineManager) -> Self {
        QueryCache {
            inner: Rc::new(RefCell::new(CacheInner {
                entries: HashMap::new(),
                listeners: SlotMap::with_key(),
            })),
            online,
        }
    }

    /// Get-or-create the query for a key. The `bool` reports creation, which
    /// is when `initial_data` may seed the entry.
    ///
    /// A key reused with a different value type is a caller bug; the stale
    /// entry is dropped and rebuilt under the new type.
    pub(crate) fn build<V: QueryValue>(&self, key: &QueryKey) -> (Query<V>, bool) {
        let existing = {
            let inner = self.inner.borrow();
            inner.entries.get(key).cloned()
        };

        if let Some(entry) = existing {
            if let Some(query) = entry.as_any().downcast_ref::<Query<V>>() {
                return (query.clone(), false);
            }
            tracing::warn!(
                key = %key,
                "query key reused with a different value type, replacing entry"
            );
            self.remove(key);
        }

        let query = Query::<V>::new(key.clone(), Rc::downgrade(&self.inner), self.online.clone());
        self.inner
            .borrow_mut()
            .entries
            .insert(key.clone(), Rc::new(query.clone()));
        emit(&self.inner, CacheEvent::Added(key.clone()));
        (query, true)
    }

    /// Typed lookup without creating.
    pub(crate) fn get<V: QueryValue>(&self, key: &QueryKey) -> Result<Option<Query<V>>, QueryError> {
        let entry = {
            let inner = self.inner.borrow();
            inner.entries.get(key).cloned()
        };
        match entry {
            None => Ok(None),
            Some(entry) => match entry.as_any().downcast_ref::<Query<V>>() {
                Some(query) => Ok(Some(query.clone())),
                None => Err(QueryError::type_mismatch::<V>()),
            },
        }
    }

    pub(crate) fn find_all(&self, filters: &QueryFilters) -> Vec<Rc<dyn CacheEntry>> {
        let entries: Vec<Rc<dyn CacheEntry>> = {
            let inner = self.inner.borrow();
            inner.entries.values().cloned().collect()
        };
        entries
            .into_iter()
            .filter(|entry| filters.matches(&entry.summary()))
            .collect()
    }

    /// Summaries of matching entries, for introspection.
    pub fn summaries(&self, filters: &QueryFilters) -> Vec<QueryEntrySummary> {
        self.find_all(filters)
            .iter()
            .map(|entry| entry.summary())
            .collect()
    }

    /// Disposes the entry under `key`, cancelling in-flight work.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = self.inner.borrow_mut().entries.remove(key);
        match removed {
            Some(entry) => {
                entry.dispose_entry();
                emit(&self.inner, CacheEvent::Removed(key.clone()));
                true
            }
            None => false,
        }
    }

    /// Disposes every entry.
    pub fn clear(&self) {
        let entries: Vec<(QueryKey, Rc<dyn CacheEntry>)> = {
            let mut inner = self.inner.borrow_mut();
            inner.entries.drain().collect()
        };
        for (key, entry) in entries {
            entry.dispose_entry();
            emit(&self.inner, CacheEvent::Removed(key));
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Returns `true` when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Subscribes to cache events.
    pub fn subscribe(&self, listener: impl Fn(&CacheEvent) + 'static) -> CacheSubscription {
        self.inner.borrow_mut().listeners.insert(Rc::new(listener))
    }

    /// Removes a cache-event subscription.
    pub fn unsubscribe(&self, key: CacheSubscription) {
        self.inner.borrow_mut().listeners.remove(key);
    }
}

fn emit(inner: &Rc<RefCell<CacheInner>>, event: CacheEvent) {
    let listeners: Vec<Rc<dyn Fn(&CacheEvent)>> = {
        let inner = inner.borrow();
        inner.listeners.values().cloned().collect()
    };
    for listener in listeners {
        listener(&event);
    }
}

/// State-change notification from a query; called outside any cache borrow.
pub(crate) fn emit_updated(inner: &Rc<RefCell<CacheInner>>, key: &QueryKey) {
    emit(inner, CacheEvent::Updated(key.clone()));
}

/// GC expiry: dispose the entry unless an observer re-attached after the
/// timer fired.
pub(crate) fn evict_if_idle(inner: &Rc<RefCell<CacheInner>>, key: &QueryKey) {
    let entry = {
        let inner = inner.borrow();
        inner.entries.get(key).cloned()
    };
    let Some(entry) = entry else {
        return;
    };
    if entry.observers() > 0 {
        return;
    }

    tracing::debug!(key = %key, "garbage collecting idle query");
    inner.borrow_mut().entries.remove(key);
    entry.dispose_entry();
    emit(inner, CacheEvent::Removed(key.clone()));
}
