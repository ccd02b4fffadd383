//! Replicated objects: sibling values under a causal context.

use std::collections::BTreeMap;

use crate::context::{Dot, VersionVector};
use crate::Crdt;

/// A value as stored by a replica: either client data or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value<V> {
    /// Client-visible data.
    Live(V),
    /// A logical delete. Excluded from reads, retained for causal accounting
    /// until a later write supersedes it.
    Tombstone,
}

impl<V> Value<V> {
    /// Returns `true` for the deletion marker.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }

    /// The client data, if this is not a tombstone.
    #[must_use]
    pub fn as_live(&self) -> Option<&V> {
        match self {
            Self::Live(v) => Some(v),
            Self::Tombstone => None,
        }
    }
}

impl<V> From<V> for Value<V> {
    fn from(v: V) -> Self {
        Self::Live(v)
    }
}

/// A replicated object: the concurrently written values ("siblings") of a key
/// together with the causal context that summarizes its whole history.
///
/// Every sibling is tagged with the [`Dot`] of the write that produced it. A
/// sibling survives a merge unless the other side has observed its dot without
/// keeping it, which means a later write superseded it. The context of the
/// result is the join of both contexts.
///
/// [`CausalObject::new`] is the identity of [`Crdt::merge`], which is how
/// not-found and failed replica replies take part in a quorum read.
///
/// # Example
///
/// ```
/// use quorum_kit::prelude::*;
///
/// let mut a = CausalObject::new();
/// a.apply_write("n1", Value::Live("x"), &VersionVector::new());
///
/// let mut b = CausalObject::new();
/// b.apply_write("n2", Value::Live("y"), &VersionVector::new());
///
/// a.merge(&b);
/// assert_eq!(a.values(), vec![&"x", &"y"]);
///
/// // A write that read the merged context resolves the conflict.
/// let ctx = a.context().clone();
/// a.apply_write("n1", Value::Live("z"), &ctx);
/// assert_eq!(a.values(), vec![&"z"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CausalObject<V> {
    /// dot -> value written at that dot
    entries: BTreeMap<Dot, Value<V>>,
    context: VersionVector,
}

impl<V> Default for CausalObject<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            context: VersionVector::new(),
        }
    }
}

impl<V: Clone + Ord> CausalObject<V> {
    /// The identity object: no values, bottom context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an object holding a single fresh write by `actor`.
    pub fn with_value(actor: &str, value: V) -> Self {
        let mut obj = Self::new();
        obj.apply_write(actor, Value::Live(value), &VersionVector::new());
        obj
    }

    /// Apply a client write at the replica identified by `actor`.
    ///
    /// `client_context` is the context the client received on its last read.
    /// Every sibling whose dot it covers is superseded and dropped; siblings
    /// the client never saw are kept. The write receives a new dot greater
    /// than anything either side has seen from `actor`.
    pub fn apply_write(&mut self, actor: &str, value: Value<V>, client_context: &VersionVector) -> Dot {
        self.entries.retain(|dot, _| !client_context.contains(dot));
        self.context.merge(client_context);
        let dot = self.context.increment(actor);
        self.entries.insert(dot.clone(), value);
        dot
    }

    /// Client-visible values: tombstones removed, sorted and deduplicated.
    #[must_use]
    pub fn values(&self) -> Vec<&V> {
        let mut vals: Vec<&V> = self.entries.values().filter_map(Value::as_live).collect();
        vals.sort();
        vals.dedup();
        vals
    }

    /// The causal context. Returned to clients even when [`values`] is empty
    /// so that their next write can declare what it supersedes.
    ///
    /// [`values`]: Self::values
    #[must_use]
    pub fn context(&self) -> &VersionVector {
        &self.context
    }

    /// Iterate over every sibling, tombstones included, in dot order.
    pub fn siblings(&self) -> impl Iterator<Item = (&Dot, &Value<V>)> {
        self.entries.iter()
    }

    /// Number of siblings, tombstones included.
    #[must_use]
    pub fn sibling_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if more than one sibling survives.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.entries.len() > 1
    }

    /// Returns `true` for the identity object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.context.is_empty()
    }

    /// Returns `true` if the object has history but every sibling is a
    /// tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        !self.entries.is_empty() && self.entries.values().all(Value::is_tombstone)
    }

    /// Returns `true` if `self` has observed everything `other` has.
    #[must_use]
    pub fn descends(&self, other: &Self) -> bool {
        self.context.descends(&other.context)
    }

    /// Fold any number of replica states into one, starting from the
    /// identity.
    pub fn merge_all<'a, I>(objects: I) -> Self
    where
        I: IntoIterator<Item = &'a Self>,
        V: 'a,
    {
        objects.into_iter().fold(Self::new(), |mut acc, obj| {
            acc.merge(obj);
            acc
        })
    }
}

impl<V: Clone + Ord> Crdt for CausalObject<V> {
    fn merge(&mut self, other: &Self) {
        let mut entries = BTreeMap::new();

        // Keep our siblings that the other side either also holds or has
        // never observed.
        for (dot, value) in &self.entries {
            if other.entries.contains_key(dot) || !other.context.contains(dot) {
                entries.insert(dot.clone(), value.clone());
            }
        }

        // Add theirs that we have never observed.
        for (dot, value) in &other.entries {
            if !self.context.contains(dot) {
                entries
                    .entry(dot.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        self.context.merge(&other.context);
        self.entries = entries;
    }
}
