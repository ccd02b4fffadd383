//! Causal contexts: dots and version vectors.
//!
//! A [`VersionVector`] maps an actor (the replica that accepted a write) to the
//! highest counter it has issued that the holder has observed. Because every
//! actor issues counters contiguously, the vector is a compact encoding of a
//! down-closed set of [`Dot`]s, and two contexts can be compared and joined
//! pointwise.
//!
//! # Example
//!
//! ```
//! use quorum_kit::context::{Dot, VersionVector};
//! use quorum_kit::Crdt;
//!
//! let mut a = VersionVector::new();
//! a.increment("n1");
//!
//! let mut b = VersionVector::new();
//! b.increment("n2");
//!
//! assert!(a.concurrent(&b));
//!
//! a.merge(&b);
//! assert!(a.contains(&Dot::new("n2", 1)));
//! assert!(a.descends(&b));
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::Crdt;

/// A unique identifier for a single write: the actor that accepted it and
/// that actor's counter at the time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dot {
    /// Actor that issued the dot.
    pub actor: String,
    /// Counter issued by `actor`, starting at 1.
    pub counter: u64,
}

impl Dot {
    /// Create a dot for `actor` at `counter`.
    pub fn new(actor: impl Into<String>, counter: u64) -> Self {
        Self {
            actor: actor.into(),
            counter,
        }
    }
}

impl fmt::Display for Dot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor, self.counter)
    }
}

/// Version vector: actor -> highest observed counter.
///
/// Actors with a zero counter are never stored, so two vectors describing the
/// same history are always structurally equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VersionVector {
    counters: BTreeMap<String, u64>,
}

impl VersionVector {
    /// The bottom context: nothing observed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a vector from `(actor, counter)` pairs. Later pairs for the same
    /// actor are joined, not overwritten.
    pub fn from_entries<I, A>(entries: I) -> Self
    where
        I: IntoIterator<Item = (A, u64)>,
        A: Into<String>,
    {
        let mut vv = Self::new();
        for (actor, counter) in entries {
            vv.witness(&Dot::new(actor, counter));
        }
        vv
    }

    /// Returns `true` if nothing has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Number of actors with a non-zero counter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Counter observed for `actor`, or 0.
    #[must_use]
    pub fn get(&self, actor: &str) -> u64 {
        self.counters.get(actor).copied().unwrap_or(0)
    }

    /// Issue the next dot for `actor` and record it.
    pub fn increment(&mut self, actor: &str) -> Dot {
        let counter = self.counters.entry(actor.to_string()).or_insert(0);
        *counter += 1;
        Dot::new(actor, *counter)
    }

    /// Record that `dot` (and therefore every earlier dot of its actor) has
    /// been observed.
    pub fn witness(&mut self, dot: &Dot) {
        if dot.counter == 0 {
            return;
        }
        let counter = self.counters.entry(dot.actor.clone()).or_insert(0);
        *counter = (*counter).max(dot.counter);
    }

    /// Returns `true` if `dot` is part of the history this vector summarizes.
    #[must_use]
    pub fn contains(&self, dot: &Dot) -> bool {
        dot.counter <= self.get(&dot.actor)
    }

    /// Returns `true` if `self` has observed everything `other` has
    /// (pointwise `other <= self`).
    #[must_use]
    pub fn descends(&self, other: &Self) -> bool {
        other
            .counters
            .iter()
            .all(|(actor, &count)| self.get(actor) >= count)
    }

    /// Returns `true` if `self` strictly dominates `other`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        self.descends(other) && self != other
    }

    /// Returns `true` if neither vector descends from the other.
    #[must_use]
    pub fn concurrent(&self, other: &Self) -> bool {
        !self.descends(other) && !other.descends(self)
    }

    /// Iterate over `(actor, counter)` pairs in actor order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(a, &c)| (a.as_str(), c))
    }
}

impl Crdt for VersionVector {
    fn merge(&mut self, other: &Self) {
        for (actor, &count) in &other.counters {
            let entry = self.counters.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }
}

impl PartialOrd for VersionVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.descends(other), other.descends(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (actor, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{actor}:{counter}")?;
        }
        f.write_str("}")
    }
}

impl<A: Into<String>> FromIterator<(A, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (A, u64)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}
