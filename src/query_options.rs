//! Query configuration.
//!
//! Observer options leave most knobs unset; unset knobs fall back to the
//! [`QueryClient`](crate::QueryClient) defaults, which in turn fall back to
//! the hard defaults in [`DefaultQueryOptions::default`]. Resolution happens
//! once per observer (re)configuration.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::{Instant, KeyValue, RetryDelay, RetryPolicy};

/// How long fetched data counts as fresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleTime {
    /// Fresh for the duration after the last write. `Duration::ZERO` means
    /// immediately stale.
    After(Duration),
    /// Never stale by time; still stale when invalidated or empty.
    Infinite,
    /// Never stale, and observers never refetch it on their own. Explicit
    /// refetches still run.
    Static,
}

impl Default for StaleTime {
    fn default() -> Self {
        StaleTime::After(Duration::ZERO)
    }
}

impl From<Duration> for StaleTime {
    fn from(duration: Duration) -> Self {
        StaleTime::After(duration)
    }
}

/// How long an observer-less cache entry survives before disposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcTime {
    /// Dispose after the duration. `Duration::ZERO` disposes on the next
    /// tick after the last observer detaches.
    After(Duration),
    /// Keep forever.
    Never,
}

impl Default for GcTime {
    fn default() -> Self {
        GcTime::After(Duration::from_secs(60 * 5))
    }
}

impl From<Duration> for GcTime {
    fn from(duration: Duration) -> Self {
        GcTime::After(duration)
    }
}

/// When an observer lifecycle event (mount, focus, reconnect) refetches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RefetchPolicy {
    /// Never refetch on this event.
    Never,
    /// Refetch when the query is stale.
    #[default]
    Stale,
    /// Always refetch.
    Always,
}

/// Free-form metadata handed to fetchers through the fetch context.
pub type QueryMeta = HashMap<String, KeyValue>;

/// Result fields an observer can watch for changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultProp {
    /// `data` (after `select`).
    Data,
    /// `error`.
    Error,
    /// `status`.
    Status,
    /// `fetch_status`.
    FetchStatus,
    /// `failure_count` / `failure_reason`.
    FailureCount,
    /// `is_stale`.
    IsStale,
    /// `is_placeholder_data`.
    IsPlaceholderData,
}

/// Which result changes are forwarded to an observer's listeners.
#[derive(Clone, Debug, Default)]
pub enum NotifyOnChangeProps {
    /// Notify on any change.
    #[default]
    All,
    /// Notify only when one of the listed fields changed.
    Props(Vec<ResultProp>),
}

/// Per-observer query options. Unset fields resolve against the client
/// defaults.
#[derive(Clone, Debug)]
pub struct QueryOptions<V> {
    /// Disabled observers never trigger fetches.
    pub enabled: bool,
    /// Freshness window.
    pub stale_time: Option<StaleTime>,
    /// Cache lifetime after the last observer detaches.
    pub gc_time: Option<GcTime>,
    /// Retry policy for failed fetches.
    pub retry: Option<RetryPolicy>,
    /// Pause between retry attempts.
    pub retry_delay: Option<RetryDelay>,
    /// Refetch behavior when the observer mounts.
    pub refetch_on_mount: Option<RefetchPolicy>,
    /// Refetch behavior when the host regains focus.
    pub refetch_on_focus: Option<RefetchPolicy>,
    /// Refetch behavior when the host reconnects.
    pub refetch_on_reconnect: Option<RefetchPolicy>,
    /// Periodic background refetch while the observer is mounted.
    pub refetch_interval: Option<Duration>,
    /// Keep the interval running while the query is paused (offline).
    pub refetch_interval_in_background: bool,
    /// Observer-local stand-in shown while the first fetch is pending.
    /// Never enters the cache.
    pub placeholder_data: Option<V>,
    /// Seed data written into the cache when the entry is first created.
    pub initial_data: Option<V>,
    /// Write timestamp for `initial_data`; defaults to now.
    pub initial_data_updated_at: Option<Instant>,
    /// Which result changes notify listeners.
    pub notify_on_change_props: NotifyOnChangeProps,
    /// Keep the previous data value when a refetch returns an equal one.
    pub structural_sharing: Option<bool>,
    /// Metadata forwarded to the fetcher.
    pub meta: Option<Rc<QueryMeta>>,
}

impl<V> Default for QueryOptions<V> {
    fn default() -> Self {
        QueryOptions {
            enabled: true,
            stale_time: None,
            gc_time: None,
            retry: None,
            retry_delay: None,
            refetch_on_mount: None,
            refetch_on_focus: None,
            refetch_on_reconnect: None,
            refetch_interval: None,
            refetch_interval_in_background: false,
            placeholder_data: None,
            initial_data: None,
            initial_data_updated_at: None,
            notify_on_change_props: NotifyOnChangeProps::All,
            structural_sharing: None,
            meta: None,
        }
    }
}

impl<V> QueryOptions<V> {
    /// Options with every knob left to the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `enabled`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the freshness window.
    pub fn stale_time(mut self, stale_time: impl Into<StaleTime>) -> Self {
        self.stale_time = Some(stale_time.into());
        self
    }

    /// Sets the cache lifetime.
    pub fn gc_time(mut self, gc_time: impl Into<GcTime>) -> Self {
        self.gc_time = Some(gc_time.into());
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// Sets the retry delay.
    pub fn retry_delay(mut self, delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(delay.into());
        self
    }

    /// Sets the mount refetch policy.
    pub fn refetch_on_mount(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_mount = Some(policy);
        self
    }

    /// Sets the focus refetch policy.
    pub fn refetch_on_focus(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_focus = Some(policy);
        self
    }

    /// Sets the reconnect refetch policy.
    pub fn refetch_on_reconnect(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_reconnect = Some(policy);
        self
    }

    /// Enables interval refetching.
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Sets the placeholder value.
    pub fn placeholder_data(mut self, data: V) -> Self {
        self.placeholder_data = Some(data);
        self
    }

    /// Seeds the cache entry with data.
    pub fn initial_data(mut self, data: V) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Restricts listener notifications to the given fields.
    pub fn notify_on(mut self, props: Vec<ResultProp>) -> Self {
        self.notify_on_change_props = NotifyOnChangeProps::Props(props);
        self
    }

    /// Attaches fetcher metadata.
    pub fn meta(mut self, meta: QueryMeta) -> Self {
        self.meta = Some(Rc::new(meta));
        self
    }
}

/// Client-wide defaults for unset observer options.
#[derive(Clone, Debug)]
pub struct DefaultQueryOptions {
    /// Default freshness window. Immediately stale out of the box.
    pub stale_time: StaleTime,
    /// Default cache lifetime. Five minutes out of the box.
    pub gc_time: GcTime,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Default retry delay.
    pub retry_delay: RetryDelay,
    /// Default mount refetch policy.
    pub refetch_on_mount: RefetchPolicy,
    /// Default focus refetch policy.
    pub refetch_on_focus: RefetchPolicy,
    /// Default reconnect refetch policy.
    pub refetch_on_reconnect: RefetchPolicy,
    /// Default refetch interval. None out of the box.
    pub refetch_interval: Option<Duration>,
    /// Default structural-sharing toggle.
    pub structural_sharing: bool,
}

impl Default for DefaultQueryOptions {
    fn default() -> Self {
        DefaultQueryOptions {
            stale_time: StaleTime::After(Duration::ZERO),
            gc_time: GcTime::default(),
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            refetch_on_mount: RefetchPolicy::Stale,
            refetch_on_focus: RefetchPolicy::Stale,
            refetch_on_reconnect: RefetchPolicy::Stale,
            refetch_interval: None,
            structural_sharing: true,
        }
    }
}

/// Observer options after the three-layer merge.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedOptions<V> {
    pub enabled: bool,
    pub stale_time: StaleTime,
    pub gc_time: GcTime,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub refetch_on_mount: RefetchPolicy,
    pub refetch_on_focus: RefetchPolicy,
    pub refetch_on_reconnect: RefetchPolicy,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: bool,
    pub placeholder_data: Option<V>,
    pub initial_data: Option<V>,
    pub initial_data_updated_at: Option<Instant>,
    pub notify_on_change_props: NotifyOnChangeProps,
    pub structural_sharing: bool,
    pub meta: Option<Rc<QueryMeta>>,
}

impl<V> QueryOptions<V> {
    pub(crate) fn resolve(self, defaults: &DefaultQueryOptions) -> ResolvedOptions<V> {
        ResolvedOptions {
            enabled: self.enabled,
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            gc_time: self.gc_time.unwrap_or(defaults.gc_time),
            retry: self.retry.unwrap_or_else(|| defaults.retry.clone()),
            retry_delay: self
                .retry_delay
                .unwrap_or_else(|| defaults.retry_delay.clone()),
            refetch_on_mount: self.refetch_on_mount.unwrap_or(defaults.refetch_on_mount),
            refetch_on_focus: self.refetch_on_focus.unwrap_or(defaults.refetch_on_focus),
            refetch_on_reconnect: self
                .refetch_on_reconnect
                .unwrap_or(defaults.refetch_on_reconnect),
            refetch_interval: self.refetch_interval.or(defaults.refetch_interval),
            refetch_interval_in_background: self.refetch_interval_in_background,
            placeholder_data: self.placeholder_data,
            initial_data: self.initial_data,
            initial_data_updated_at: self.initial_data_updated_at,
            notify_on_change_props: self.notify_on_change_props,
            structural_sharing: self.structural_sharing.unwrap_or(defaults.structural_sharing),
            meta: self.meta,
        }
    }
}
