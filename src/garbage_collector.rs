//! Cache-entry garbage collection.
//!
//! Every cache entry owns one collector. The timer arms the moment the last
//! observer detaches and disarms when any observer attaches; on expiry the
//! entry is evicted through the cache, which cancels in-flight work and
//! releases state. Observers' gc times merge by keeping the longest.

use std::cell::{Cell, RefCell};
use std::rc::Weak;
use std::time::Duration;

use crate::query_cache::{self, CacheInner};
use crate::time::Timeout;
use crate::{GcTime, QueryKey};

pub(crate) struct GarbageCollector {
    key: QueryKey,
    cache: Weak<RefCell<CacheInner>>,
    // Unset until the first observer reports a gc time; merges keep the
    // longest so the most patient observer wins.
    gc_time: Cell<Option<GcTime>>,
    handle: RefCell<Option<Timeout>>,
}

impl GarbageCollector {
    pub(crate) fn new(key: QueryKey, cache: Weak<RefCell<CacheInner>>) -> Self {
        GarbageCollector {
            key,
            cache,
            gc_time: Cell::new(None),
            handle: RefCell::new(None),
        }
    }

    /// Keep the longest requested lifetime.
    pub(crate) fn update_gc_time(&self, gc_time: GcTime) {
        let merged = match (self.gc_time.get(), gc_time) {
            (None, requested) => requested,
            (Some(GcTime::Never), _) | (Some(_), GcTime::Never) => GcTime::Never,
            (Some(GcTime::After(current)), GcTime::After(requested)) => {
                GcTime::After(current.max(requested))
            }
        };
        self.gc_time.set(Some(merged));
    }

    /// Arms the timer. No-op when already armed or the entry never expires.
    pub(crate) fn enable(&self) {
        if self.handle.borrow().is_some() {
            return;
        }

        let GcTime::After(duration) = self.gc_time.get().unwrap_or_default() else {
            return;
        };

        let key = self.key.clone();
        let cache = self.cache.clone();
        let timeout = Timeout::new(duration, move || {
            if let Some(cache) = cache.upgrade() {
                query_cache::evict_if_idle(&cache, &key);
            }
        });

        *self.handle.borrow_mut() = Some(timeout);
    }

    /// Disarms the timer.
    pub(crate) fn disable(&self) {
        self.handle.borrow_mut().take();
    }

    #[cfg(test)]
    pub(crate) fn gc_time(&self) -> Option<GcTime> {
        self.gc_time.get()
    }
}
