//! Immutable query state snapshots.
//!
//! A [`QueryState`] is a value record describing one moment of a query's
//! lifecycle. Transitions build a new snapshot; the owning query swaps it in
//! and broadcasts it to observers. Nothing here is shared or mutated in
//! place.

use crate::{Instant, QueryError, QueryValue, StaleTime};

/// Result status of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    /// No successful fetch yet and no terminal error.
    Pending,
    /// Data is present.
    Success,
    /// The last fetch failed before any data existed.
    Error,
}

/// Activity status of a query, orthogonal to [`QueryStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    /// No fetcher running.
    Idle,
    /// A fetcher invocation is in flight.
    Fetching,
    /// A fetch is wanted but the host is offline.
    Paused,
}

/// Snapshot of a query at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<V> {
    /// Result status.
    pub status: QueryStatus,
    /// Activity status.
    pub fetch_status: FetchStatus,
    /// Last successfully fetched (or manually set) data.
    pub data: Option<V>,
    /// When `data` was last written.
    pub data_updated_at: Option<Instant>,
    /// Number of times `data` has been written. Monotonic.
    pub data_update_count: u32,
    /// Last terminal fetch error. A refetch error coexists with `data`.
    pub error: Option<QueryError>,
    /// When `error` was last written.
    pub error_updated_at: Option<Instant>,
    /// Number of times `error` has been written. Monotonic.
    pub error_update_count: u32,
    /// Failed attempts of the current (or last) fetch. Reset on success.
    pub failure_count: u32,
    /// Error of the most recent failed attempt. Reset on success.
    pub failure_reason: Option<QueryError>,
    /// Marked by invalidation; cleared when a fetch starts.
    pub is_invalidated: bool,
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        QueryState {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            data_updated_at: None,
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            failure_count: 0,
            failure_reason: None,
            is_invalidated: false,
        }
    }
}

impl<V: QueryValue> QueryState<V> {
    /// The state of a freshly created query.
    pub fn initial() -> Self {
        Self::default()
    }

    /// Initial state seeded with data, as used by `initial_data`.
    pub fn with_initial_data(data: V, updated_at: Instant) -> Self {
        QueryState {
            status: QueryStatus::Success,
            data: Some(data),
            data_updated_at: Some(updated_at),
            data_update_count: 1,
            ..Self::default()
        }
    }

    /// Returns `true` if data is present.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Returns `true` while no data and no terminal error exist.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Returns `true` while a fetcher invocation is in flight.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// Returns `true` while a wanted fetch waits for connectivity.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// Staleness under the given policy: no data, invalidated, or data older
    /// than the stale duration. `Infinite` and `Static` never expire by time.
    pub fn is_stale(&self, stale_time: StaleTime) -> bool {
        if self.is_invalidated || self.data.is_none() {
            return true;
        }
        match (stale_time, self.data_updated_at) {
            (StaleTime::After(duration), Some(updated_at)) => {
                crate::util::time_until_stale(updated_at, duration).is_zero()
            }
            (StaleTime::After(_), None) => true,
            (StaleTime::Infinite | StaleTime::Static, _) => false,
        }
    }

    pub(crate) fn fetch_started(mut self) -> Self {
        self.fetch_status = FetchStatus::Fetching;
        self.is_invalidated = false;
        self
    }

    pub(crate) fn fetch_paused(mut self) -> Self {
        self.fetch_status = FetchStatus::Paused;
        self
    }

    pub(crate) fn fetch_resumed(mut self) -> Self {
        self.fetch_status = FetchStatus::Fetching;
        self
    }

    /// One attempt failed; the retry scheduler may still go again. Status
    /// does not flip here.
    pub(crate) fn attempt_failed(mut self, error: QueryError) -> Self {
        self.failure_count += 1;
        self.failure_reason = Some(error);
        self
    }

    /// Terminal success. An existing write newer than `updated_at` wins the
    /// timestamp compare and keeps its data.
    pub(crate) fn fetch_succeeded(mut self, data: V, updated_at: Instant, structural: bool) -> Self {
        let superseded = self
            .data_updated_at
            .map_or(false, |current| current > updated_at);

        if !superseded {
            self.data = Some(match self.data.take() {
                Some(old) if structural && old == data => old,
                _ => data,
            });
            self.data_updated_at = Some(updated_at);
            self.data_update_count += 1;
        }

        self.status = QueryStatus::Success;
        self.fetch_status = FetchStatus::Idle;
        self.error = None;
        self.failure_count = 0;
        self.failure_reason = None;
        self.is_invalidated = false;
        self
    }

    /// Terminal failure after the retry policy gave up. With prior data the
    /// status stays `Success` and the error rides alongside.
    pub(crate) fn fetch_failed(mut self, error: QueryError, at: Instant) -> Self {
        if self.data.is_none() {
            self.status = QueryStatus::Error;
        }
        self.error = Some(error);
        self.error_updated_at = Some(at);
        self.error_update_count += 1;
        self.fetch_status = FetchStatus::Idle;
        self
    }

    /// Manual write outside a fetch. Rejected (returning `None`) when an
    /// existing write is newer.
    pub(crate) fn data_set(mut self, data: V, updated_at: Instant, structural: bool) -> Option<Self> {
        if self
            .data_updated_at
            .map_or(false, |current| current > updated_at)
        {
            return None;
        }

        self.data = Some(match self.data.take() {
            Some(old) if structural && old == data => old,
            _ => data,
        });
        self.status = QueryStatus::Success;
        self.data_updated_at = Some(updated_at);
        self.data_update_count += 1;
        self.error = None;
        self.is_invalidated = false;
        Some(self)
    }

    pub(crate) fn invalidated(mut self) -> Self {
        self.is_invalidated = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn success_resets_failure_tracking() {
        let state = QueryState::<u32>::initial()
            .fetch_started()
            .attempt_failed(QueryError::msg("try 1"))
            .attempt_failed(QueryError::msg("try 2"));
        assert_eq!(state.failure_count, 2);
        assert_eq!(state.status, QueryStatus::Pending);

        let state = state.fetch_succeeded(7, Instant::now(), true);
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.failure_count, 0);
        assert!(state.failure_reason.is_none());
        assert_eq!(state.data, Some(7));
        assert_eq!(state.data_update_count, 1);
    }

    #[test]
    fn refetch_error_keeps_data() {
        let now = Instant::now();
        let state = QueryState::with_initial_data(1, now)
            .fetch_started()
            .attempt_failed(QueryError::msg("boom"))
            .fetch_failed(QueryError::msg("boom"), now);

        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(1));
        assert!(state.error.is_some());
        assert_eq!(state.error_update_count, 1);
    }

    #[test]
    fn first_error_flips_status() {
        let state = QueryState::<u32>::initial()
            .fetch_started()
            .fetch_failed(QueryError::msg("boom"), Instant::now());
        assert_eq!(state.status, QueryStatus::Error);
        assert!(state.data.is_none());
    }

    #[test]
    fn older_manual_write_is_rejected() {
        let newer = Instant::now();
        let older = Instant(newer.0 - Duration::from_secs(10));

        let state = QueryState::with_initial_data(1, newer);
        assert!(state.clone().data_set(2, older, true).is_none());
        assert!(state.data_set(2, newer + Duration::from_secs(1), true).is_some());
    }

    #[test]
    fn staleness() {
        let state = QueryState::<u32>::initial();
        assert!(state.is_stale(StaleTime::After(Duration::from_secs(60))));

        let state = QueryState::with_initial_data(1, Instant::now());
        assert!(!state.is_stale(StaleTime::After(Duration::from_secs(60))));
        assert!(state.is_stale(StaleTime::After(Duration::ZERO)));
        assert!(!state.is_stale(StaleTime::Infinite));
        assert!(!state.is_stale(StaleTime::Static));
        assert!(state.invalidated().is_stale(StaleTime::Infinite));
    }
}
