//! Conflict resolution for concurrent remote mutations.
//!
//! A remote operation whose vector clock is concurrent with local state
//! cannot be applied blindly; the resolver decides what the surviving
//! truth looks like. Strategies are pure decision tables so they can be
//! tested without a cluster, and deliberately total: every strategy
//! produces an answer for every conflict, including remove-vs-update.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::atom::Atom;
use crate::clock::{ClockOrdering, VectorClock};
use crate::error::ValidationError;
use crate::truth::{TruthValue, TRUTH_EPSILON};

/// How a node resolves concurrent mutations of the same atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The arriving operation always wins.
    LastWriteWins,
    /// Truth values are merged; both bodies of evidence survive.
    MergeTruthValues,
    /// Causally later side wins; ties fall back to last-write-wins.
    VectorClock,
    /// Peers vote on which truth value to keep.
    ConsensusVoting,
}

impl ConflictStrategy {
    /// Canonical config-file name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::MergeTruthValues => "merge_truth_values",
            Self::VectorClock => "vector_clock",
            Self::ConsensusVoting => "consensus_voting",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ConflictStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_write_wins" => Ok(Self::LastWriteWins),
            "merge_truth_values" => Ok(Self::MergeTruthValues),
            "vector_clock" => Ok(Self::VectorClock),
            "consensus_voting" => Ok(Self::ConsensusVoting),
            other => Err(ValidationError::InvalidConfig {
                reason: format!(
                    "unknown conflict strategy '{other}' (expected last_write_wins, \
                     merge_truth_values, vector_clock or consensus_voting)"
                ),
            }),
        }
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply the arriving operation as-is.
    ApplyIncoming,
    /// Keep local state; drop the arriving operation.
    KeepLocal,
    /// Keep the atom with this merged truth value.
    Merge(TruthValue),
    /// A vote round is required before the conflict can settle.
    NeedsVote,
}

/// Applies a [`ConflictStrategy`] to individual conflicts.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Creates a resolver with the given strategy.
    #[must_use]
    pub const fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// Returns the configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolves a conflict between the local atom and an arriving
    /// mutation.
    ///
    /// `incoming_tv` is `None` when the arriving operation removes the
    /// atom; merge-flavored outcomes then keep the local atom, since
    /// there is nothing to merge with.
    #[must_use]
    pub fn resolve(
        &self,
        local: &Atom,
        incoming_tv: Option<&TruthValue>,
        local_clock: &VectorClock,
        remote_clock: &VectorClock,
    ) -> Resolution {
        match self.strategy {
            ConflictStrategy::LastWriteWins => Resolution::ApplyIncoming,
            ConflictStrategy::MergeTruthValues => match incoming_tv {
                Some(tv) => Resolution::Merge(local.tv().merge(tv)),
                None => Resolution::KeepLocal,
            },
            ConflictStrategy::VectorClock => match local_clock.compare(remote_clock) {
                ClockOrdering::After => Resolution::KeepLocal,
                ClockOrdering::Before
                | ClockOrdering::Equal
                | ClockOrdering::Concurrent => Resolution::ApplyIncoming,
            },
            ConflictStrategy::ConsensusVoting => Resolution::NeedsVote,
        }
    }
}

/// Deterministic preference between two truth values, used both to cast
/// votes and to break vote ties identically on every node.
///
/// Prefers higher confidence, then higher strength, then the incoming
/// side. Differences below [`TRUTH_EPSILON`] count as ties.
#[must_use]
pub fn prefer_incoming(local_tv: &TruthValue, incoming_tv: &TruthValue) -> bool {
    let (local_c, incoming_c) = (local_tv.confidence(), incoming_tv.confidence());
    if (incoming_c - local_c).abs() >= TRUTH_EPSILON {
        return incoming_c > local_c;
    }

    let (local_s, incoming_s) = (local_tv.strength(), incoming_tv.strength());
    if (incoming_s - local_s).abs() >= TRUTH_EPSILON {
        return incoming_s > local_s;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomType;
    use crate::cluster::member::NodeId;

    fn local_atom() -> Atom {
        Atom::node_with_tv(
            AtomType::Concept,
            "subject",
            TruthValue::simple(0.9, 0.8).unwrap(),
        )
        .unwrap()
    }

    fn clocks_concurrent() -> (VectorClock, VectorClock) {
        let (a, b) = (NodeId::new("a").unwrap(), NodeId::new("b").unwrap());
        let mut local = VectorClock::new();
        local.increment(&a);
        let mut remote = VectorClock::new();
        remote.increment(&b);
        (local, remote)
    }

    #[test]
    fn test_last_write_wins_always_applies() {
        let resolver = ConflictResolver::new(ConflictStrategy::LastWriteWins);
        let (local_clock, remote_clock) = clocks_concurrent();
        let incoming = TruthValue::simple(0.1, 0.1).unwrap();

        let outcome = resolver.resolve(&local_atom(), Some(&incoming), &local_clock, &remote_clock);
        assert_eq!(outcome, Resolution::ApplyIncoming);

        let remove = resolver.resolve(&local_atom(), None, &local_clock, &remote_clock);
        assert_eq!(remove, Resolution::ApplyIncoming);
    }

    #[test]
    fn test_merge_strategy_merges_truth() {
        let resolver = ConflictResolver::new(ConflictStrategy::MergeTruthValues);
        let (local_clock, remote_clock) = clocks_concurrent();
        let incoming = TruthValue::simple(0.5, 0.5).unwrap();

        let outcome = resolver.resolve(&local_atom(), Some(&incoming), &local_clock, &remote_clock);
        match outcome {
            Resolution::Merge(tv) => {
                assert!((tv.strength() - 0.746_153_8).abs() < 1e-4);
                assert!((tv.confidence() - 1.0).abs() < 1e-6);
            }
            other => panic!("expected Merge, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_strategy_keeps_local_against_remove() {
        let resolver = ConflictResolver::new(ConflictStrategy::MergeTruthValues);
        let (local_clock, remote_clock) = clocks_concurrent();

        let outcome = resolver.resolve(&local_atom(), None, &local_clock, &remote_clock);
        assert_eq!(outcome, Resolution::KeepLocal);
    }

    #[test]
    fn test_vector_clock_strategy_prefers_later() {
        let resolver = ConflictResolver::new(ConflictStrategy::VectorClock);
        let a = NodeId::new("a").unwrap();
        let incoming = TruthValue::simple(0.5, 0.5).unwrap();

        let mut earlier = VectorClock::new();
        earlier.increment(&a);
        let mut later = earlier.clone();
        later.increment(&a);

        // Local is causally later: keep it.
        let keep = resolver.resolve(&local_atom(), Some(&incoming), &later, &earlier);
        assert_eq!(keep, Resolution::KeepLocal);

        // Remote is causally later: take it.
        let take = resolver.resolve(&local_atom(), Some(&incoming), &earlier, &later);
        assert_eq!(take, Resolution::ApplyIncoming);
    }

    #[test]
    fn test_vector_clock_strategy_concurrent_falls_back_to_lww() {
        let resolver = ConflictResolver::new(ConflictStrategy::VectorClock);
        let (local_clock, remote_clock) = clocks_concurrent();
        let incoming = TruthValue::simple(0.5, 0.5).unwrap();

        let outcome = resolver.resolve(&local_atom(), Some(&incoming), &local_clock, &remote_clock);
        assert_eq!(outcome, Resolution::ApplyIncoming);
    }

    #[test]
    fn test_consensus_strategy_requests_vote() {
        let resolver = ConflictResolver::new(ConflictStrategy::ConsensusVoting);
        let (local_clock, remote_clock) = clocks_concurrent();
        let incoming = TruthValue::simple(0.5, 0.5).unwrap();

        let outcome = resolver.resolve(&local_atom(), Some(&incoming), &local_clock, &remote_clock);
        assert_eq!(outcome, Resolution::NeedsVote);
    }

    #[test]
    fn test_prefer_incoming_by_confidence() {
        let weak = TruthValue::simple(0.9, 0.2).unwrap();
        let strong = TruthValue::simple(0.1, 0.9).unwrap();
        assert!(prefer_incoming(&weak, &strong));
        assert!(!prefer_incoming(&strong, &weak));
    }

    #[test]
    fn test_prefer_incoming_by_strength_on_confidence_tie() {
        let low = TruthValue::simple(0.3, 0.5).unwrap();
        let high = TruthValue::simple(0.8, 0.5).unwrap();
        assert!(prefer_incoming(&low, &high));
        assert!(!prefer_incoming(&high, &low));
    }

    #[test]
    fn test_prefer_incoming_exact_tie_takes_incoming() {
        let tv = TruthValue::simple(0.5, 0.5).unwrap();
        assert!(prefer_incoming(&tv, &tv.clone()));
    }

    #[test]
    fn test_strategy_parse_and_display() {
        for strategy in [
            ConflictStrategy::LastWriteWins,
            ConflictStrategy::MergeTruthValues,
            ConflictStrategy::VectorClock,
            ConflictStrategy::ConsensusVoting,
        ] {
            let parsed: ConflictStrategy = strategy.name().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
        assert!("quorum".parse::<ConflictStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_snake_case() {
        let json = serde_json::to_string(&ConflictStrategy::MergeTruthValues).unwrap();
        assert_eq!(json, "\"merge_truth_values\"");
    }
}
