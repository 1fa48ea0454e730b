//! Vector clocks for causal ordering of replicated mutations.
//!
//! Each node increments its own entry when it originates a mutation and
//! merges remote clocks pointwise as operations arrive. Comparing two
//! clocks classifies the mutations they stamp as ordered or concurrent;
//! concurrent mutations are what the conflict resolver exists for.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Identical entries.
    Equal,
    /// Strictly earlier: every entry less or equal, at least one less.
    Before,
    /// Strictly later: every entry greater or equal, at least one greater.
    After,
    /// Neither precedes the other.
    Concurrent,
}

/// Per-node logical counters.
///
/// Entries absent from the map read as zero, so clocks from nodes that
/// have never heard of each other still compare correctly.
///
/// # Examples
///
/// ```
/// use cogmesh::{ClockOrdering, NodeId, VectorClock};
///
/// let node = NodeId::new("alpha").unwrap();
/// let mut a = VectorClock::new();
/// a.increment(&node);
///
/// let b = VectorClock::new();
/// assert_eq!(b.compare(&a), ClockOrdering::Before);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Creates an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances this node's entry and returns the new counter value.
    pub fn increment(&mut self, node: &NodeId) -> u64 {
        let counter = self.entries.entry(node.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Returns the counter for a node, zero if absent.
    #[must_use]
    pub fn get(&self, node: &NodeId) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Merges another clock into this one, taking the pointwise maximum.
    ///
    /// Idempotent: merging the same clock again changes nothing.
    pub fn merge(&mut self, other: &Self) {
        for (node, &counter) in &other.entries {
            let entry = self.entries.entry(node.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Classifies the causal relationship with another clock.
    #[must_use]
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let keys: BTreeSet<&NodeId> = self.entries.keys().chain(other.entries.keys()).collect();

        let mut some_less = false;
        let mut some_greater = false;
        for key in keys {
            let a = self.get(key);
            let b = other.get(key);
            if a < b {
                some_less = true;
            } else if a > b {
                some_greater = true;
            }
        }

        match (some_less, some_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Returns true if this clock is pointwise greater than or equal to
    /// the other: the other's mutations are already accounted for here.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Equal | ClockOrdering::After
        )
    }

    /// Number of nodes with a non-default entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no node has ever incremented this clock.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in node-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.entries.iter().map(|(node, &counter)| (node, counter))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (node, counter)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{node}:{counter}")?;
        }
        write!(f, "}}")
    }
}
