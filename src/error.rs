use std::error::Error as StdError;
use std::fmt::Display;
use std::sync::Arc;

use crate::QueryKey;

/// A cloneable error value.
///
/// Errors live inside cached state and are handed to every observer of a
/// query, so they must be cheap to clone. `QueryError` wraps the original
/// error in an [`Arc`] and keeps it downcastable.
#[derive(Clone)]
pub struct QueryError(Arc<dyn StdError + Send + Sync + 'static>);

impl QueryError {
    /// Wraps an error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        QueryError(Arc::new(error))
    }

    /// Constructs an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        QueryError::new(MessageError(message.into()))
    }

    /// Attempts to downcast to a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if this error was produced by a cancelled fetch.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.downcast_ref::<CoreError>(), Some(CoreError::Cancelled))
    }

    pub(crate) fn cancelled() -> Self {
        QueryError::new(CoreError::Cancelled)
    }

    pub(crate) fn missing_fetcher(key: &QueryKey) -> Self {
        QueryError::new(CoreError::MissingFetcher(key.clone()))
    }

    pub(crate) fn key_not_found(key: &QueryKey) -> Self {
        QueryError::new(CoreError::KeyNotFound(key.clone()))
    }

    pub(crate) fn type_mismatch<T: 'static>() -> Self {
        QueryError::new(CoreError::TypeMismatch(std::any::type_name::<T>()))
    }

    pub(crate) fn mutation_pending() -> Self {
        QueryError::new(CoreError::MutationPending)
    }
}

// Observer results compare errors by identity: the same terminal failure is
// broadcast as one Arc, and distinct failures are distinct events.
impl PartialEq for QueryError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for QueryError {
    fn from(message: String) -> Self {
        QueryError::msg(message)
    }
}

impl From<&str> for QueryError {
    fn from(message: &str) -> Self {
        QueryError::msg(message)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for MessageError {}

/// Errors produced by the cache core itself, as opposed to errors returned
/// by a user-supplied fetcher.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The fetch was cancelled before it settled. Never stored in query
    /// state; only surfaced to callers awaiting the cancelled fetch.
    #[error("fetch was cancelled")]
    Cancelled,

    /// A fetch was requested for a query that has no fetcher installed.
    #[error("no fetcher registered for key {0}")]
    MissingFetcher(QueryKey),

    /// No cache entry exists for the key.
    #[error("no query found for key {0}")]
    KeyNotFound(QueryKey),

    /// The cached value under this key has a different type.
    #[error("cached value is not a `{0}`")]
    TypeMismatch(&'static str),

    /// `mutate` or `reset` was called while the mutation was still pending.
    #[error("mutation is still pending")]
    MutationPending,
}
