//! Filters for fleet operations.
//!
//! Every [`QueryClient`](crate::QueryClient) fleet operation (invalidate,
//! refetch, cancel, reset, remove) selects its targets through a
//! [`QueryFilters`]: an optional key prefix (or exact key), an
//! active/inactive kind, staleness and fetching predicates, and a free-form
//! predicate over a summary of the entry.

use std::rc::Rc;

use crate::{MutationStatus, QueryKey};

/// Which entries a filter considers by observer activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueryTypeFilter {
    /// Entries with and without enabled observers.
    #[default]
    All,
    /// Only entries with at least one enabled observer.
    Active,
    /// Only entries without enabled observers.
    Inactive,
}

/// A filter-visible snapshot of a cache entry.
#[derive(Clone, Debug)]
pub struct QueryEntrySummary {
    /// The entry's key.
    pub key: QueryKey,
    /// Whether any enabled observer is attached.
    pub is_active: bool,
    /// Entry-level staleness.
    pub is_stale: bool,
    /// Whether a fetch is in flight.
    pub is_fetching: bool,
    /// Whether the entry is invalidated.
    pub is_invalidated: bool,
    /// Attached observer count.
    pub observer_count: usize,
}

/// Selects queries for a fleet operation. The default filter matches every
/// entry.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match keys with this prefix (whole key when `exact`).
    pub query_key: Option<QueryKey>,
    /// Require the whole key to equal `query_key`.
    pub exact: bool,
    /// Restrict by observer activity.
    pub kind: QueryTypeFilter,
    /// Require a specific staleness.
    pub stale: Option<bool>,
    /// Require a specific fetching state.
    pub fetching: Option<bool>,
    /// Free-form predicate, applied last.
    pub predicate: Option<Rc<dyn Fn(&QueryEntrySummary) -> bool>>,
}

impl QueryFilters {
    /// Filter matching every entry under the key prefix.
    pub fn prefix(key: impl Into<QueryKey>) -> Self {
        QueryFilters {
            query_key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Filter matching exactly one key.
    pub fn exact(key: impl Into<QueryKey>) -> Self {
        QueryFilters {
            query_key: Some(key.into()),
            exact: true,
            ..Default::default()
        }
    }

    /// Restricts the filter by observer activity.
    pub fn kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    /// Requires a specific staleness.
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Requires a specific fetching state.
    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    /// Adds a free-form predicate.
    pub fn predicate(mut self, predicate: impl Fn(&QueryEntrySummary) -> bool + 'static) -> Self {
        self.predicate = Some(Rc::new(predicate));
        self
    }

    pub(crate) fn matches(&self, summary: &QueryEntrySummary) -> bool {
        if let Some(key) = &self.query_key {
            let key_matches = if self.exact {
                *key == summary.key
            } else {
                key.is_prefix_of(&summary.key)
            };
            if !key_matches {
                return false;
            }
        }

        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active => {
                if !summary.is_active {
                    return false;
                }
            }
            QueryTypeFilter::Inactive => {
                if summary.is_active {
                    return false;
                }
            }
        }

        if let Some(stale) = self.stale {
            if summary.is_stale != stale {
                return false;
            }
        }
        if let Some(fetching) = self.fetching {
            if summary.is_fetching != fetching {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(summary) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetching", &self.fetching)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

/// How `invalidate_queries` follows up on matched queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RefetchType {
    /// Refetch matched queries that have enabled observers.
    #[default]
    Active,
    /// Refetch matched queries without enabled observers.
    Inactive,
    /// Refetch every matched query.
    All,
    /// Mark only; refetch nothing.
    None,
}

/// A filter-visible snapshot of a mutation.
#[derive(Clone, Debug)]
pub struct MutationSummary {
    /// The mutation's key, when one was assigned.
    pub mutation_key: Option<QueryKey>,
    /// Current status.
    pub status: MutationStatus,
}

/// Selects mutations in the mutation cache.
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Match mutation keys with this prefix (whole key when `exact`).
    pub mutation_key: Option<QueryKey>,
    /// Require the whole key to equal `mutation_key`.
    pub exact: bool,
    /// Require a specific status.
    pub status: Option<MutationStatus>,
    /// Free-form predicate, applied last.
    pub predicate: Option<Rc<dyn Fn(&MutationSummary) -> bool>>,
}

impl MutationFilters {
    /// Filter matching every mutation under the key prefix.
    pub fn prefix(key: impl Into<QueryKey>) -> Self {
        MutationFilters {
            mutation_key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Requires a specific status.
    pub fn status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds a free-form predicate.
    pub fn predicate(mut self, predicate: impl Fn(&MutationSummary) -> bool + 'static) -> Self {
        self.predicate = Some(Rc::new(predicate));
        self
    }

    pub(crate) fn matches(&self, summary: &MutationSummary) -> bool {
        if let Some(key) = &self.mutation_key {
            let Some(candidate) = &summary.mutation_key else {
                return false;
            };
            let key_matches = if self.exact {
                key == candidate
            } else {
                key.is_prefix_of(candidate)
            };
            if !key_matches {
                return false;
            }
        }
        if let Some(status) = self.status {
            if summary.status != status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(summary) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationFilters")
            .field("mutation_key", &self.mutation_key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}
