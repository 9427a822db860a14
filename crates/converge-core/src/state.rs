//! State definitions
//!
//! A reconciled state is a caller-owned record. The reconciler never looks
//! inside it: it folds partial updates over it with `Mergeable::merge` and
//! compares whole states with a caller-supplied predicate.

use std::collections::btree_map::{self, BTreeMap};
use std::fmt::Debug;

/// A state that accepts partial updates.
///
/// `merge` is a shallow override. Every field named by the partial replaces
/// the corresponding field wholesale, every other field is kept. Nested
/// values are never merged recursively.
pub trait Mergeable: Clone + Debug + Send + Sync + 'static {
    /// Subset-of-fields update, typically a struct of `Option`s
    type Partial: Debug + Send + 'static;

    /// Produce a new state with `partial` applied over `self`
    fn merge(&self, partial: Self::Partial) -> Self;
}

/// Ordered field-name to value record with shallow merge.
///
/// For callers that want a dynamic record rather than a dedicated struct.
/// The partial update type is another `FieldMap` holding only the fields
/// to overwrite.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldMap<K: Ord, V> {
    fields: BTreeMap<K, V>,
}

impl<K: Ord, V> FieldMap<K, V> {
    pub fn new() -> Self {
        FieldMap {
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: K, value: V) -> Self {
        self.fields.insert(key, value);
        self
    }

    /// Get a field value
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.fields.get(key)
    }

    /// Set a field, returning the previous value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.fields.insert(key, value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.fields.iter()
    }
}

impl<K: Ord, V> Default for FieldMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Mergeable for FieldMap<K, V>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Debug + Send + Sync + 'static,
{
    type Partial = FieldMap<K, V>;

    fn merge(&self, partial: FieldMap<K, V>) -> Self {
        let mut merged = self.clone();
        merged.fields.extend(partial.fields);
        merged
    }
}

impl<K: Ord, V> From<BTreeMap<K, V>> for FieldMap<K, V> {
    fn from(fields: BTreeMap<K, V>) -> Self {
        FieldMap { fields }
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for FieldMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        FieldMap {
            fields: iter.into_iter().collect(),
        }
    }
}

impl<K: Ord, V> IntoIterator for FieldMap<K, V> {
    type Item = (K, V);
    type IntoIter = btree_map::IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a, K: Ord, V> IntoIterator for &'a FieldMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = btree_map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}
