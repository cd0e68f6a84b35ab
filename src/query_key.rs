//! Structural query keys.
//!
//! A [`QueryKey`] is an ordered list of values and is the sole identity of a
//! query. Maps and sets inside a key compare order-insensitively, so two
//! keys built from the same entries in different insertion order are equal
//! and hash identically. A key `a` *contains* a key `b` as a prefix when
//! `a` is no longer than `b` and every element matches — the basis of
//! non-exact cache filters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// One element of a [`QueryKey`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number, totally ordered via `f64::total_cmp`.
    Float(KeyFloat),
    /// String.
    Str(String),
    /// Ordered list of values.
    List(Vec<KeyValue>),
    /// String-keyed map; insertion order does not affect identity.
    Map(BTreeMap<String, KeyValue>),
    /// Set of values; insertion order does not affect identity.
    Set(BTreeSet<KeyValue>),
}

impl KeyValue {
    /// Builds a [`KeyValue::Map`] from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<KeyValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        KeyValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a [`KeyValue::Set`] from values.
    pub fn set<V, I>(values: I) -> Self
    where
        V: Into<KeyValue>,
        I: IntoIterator<Item = V>,
    {
        KeyValue::Set(values.into_iter().map(Into::into).collect())
    }
}

/// An `f64` with total ordering, usable inside keys.
#[derive(Clone, Copy, Debug)]
pub struct KeyFloat(pub f64);

impl PartialEq for KeyFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for KeyFloat {}

impl PartialOrd for KeyFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for KeyFloat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<u32> for KeyValue {
    fn from(v: u32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<usize> for KeyValue {
    fn from(v: usize) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<f64> for KeyValue {
    fn from(v: f64) -> Self {
        KeyValue::Float(KeyFloat(v))
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Str(v.to_owned())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Str(v)
    }
}

impl<V: Into<KeyValue>> From<Vec<V>> for KeyValue {
    fn from(v: Vec<V>) -> Self {
        KeyValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => write!(f, "null"),
            KeyValue::Bool(v) => write!(f, "{v}"),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Float(v) => write!(f, "{}", v.0),
            KeyValue::Str(v) => write!(f, "{v:?}"),
            KeyValue::List(v) => f.debug_list().entries(v).finish(),
            KeyValue::Map(v) => f.debug_map().entries(v).finish(),
            KeyValue::Set(v) => f.debug_set().entries(v).finish(),
        }
    }
}

/// Identity of a query: an ordered list of [`KeyValue`]s.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey(Vec<KeyValue>);

impl QueryKey {
    /// An empty key. Matches every key as a prefix.
    pub fn new() -> Self {
        QueryKey(Vec::new())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the key has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The key's elements in order.
    pub fn parts(&self) -> &[KeyValue] {
        &self.0
    }

    /// Appends an element, returning the extended key.
    pub fn with(mut self, part: impl Into<KeyValue>) -> Self {
        self.0.push(part.into());
        self
    }

    /// Returns `true` if `self` is a prefix of `other`.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }
}

impl<V: Into<KeyValue>> FromIterator<V> for QueryKey {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        QueryKey(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<KeyValue>> for QueryKey {
    fn from(parts: Vec<KeyValue>) -> Self {
        QueryKey(parts)
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        QueryKey(vec![part.into()])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        QueryKey(vec![part.into()])
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.0).finish()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Builds a [`QueryKey`] from heterogeneous elements.
///
/// ```
/// use async_query::{query_key, KeyValue};
///
/// let key = query_key!["todos", 1, KeyValue::map([("done", false)])];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::QueryKey::new()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::QueryKey::from(vec![$($crate::KeyValue::from($part)),+])
    };
}
