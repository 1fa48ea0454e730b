//! Atom placement policies for partitioned deployments.
//!
//! The cluster layer replicates every atom to every member; a storage
//! coordinator that wants to spread atoms across nodes instead consumes
//! the [`AtomPlacement`] trait. [`PolicyPlacement`] is the built-in
//! implementation: a partition scheme picks the primary owner and a
//! replication mode widens it to the replica set. Rebalancing after
//! membership changes is the coordinator's job, not the policy's.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::atom::Atom;
use crate::cluster::member::{MemberInfo, NodeId};
use crate::error::ValidationError;

/// How the primary owner of an atom is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    /// Owners rotate through the membership in id order.
    RoundRobin,
    /// The atom's handle hashes to its owner; placement is stable for
    /// the life of the atom.
    HashBased,
    /// Atoms of one type share an owner.
    TypeBased,
    /// The least-loaded member at assignment time owns the atom.
    LoadBalanced,
}

impl PartitionScheme {
    /// Canonical config-file name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::HashBased => "hash_based",
            Self::TypeBased => "type_based",
            Self::LoadBalanced => "load_balanced",
        }
    }
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PartitionScheme {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "hash_based" => Ok(Self::HashBased),
            "type_based" => Ok(Self::TypeBased),
            "load_balanced" => Ok(Self::LoadBalanced),
            other => Err(ValidationError::InvalidConfig {
                reason: format!(
                    "unknown partition scheme '{other}' (expected round_robin, \
                     hash_based, type_based or load_balanced)"
                ),
            }),
        }
    }
}

/// How many members hold a copy of each atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// The primary owner only.
    SingleCopy,
    /// The primary plus one backup.
    PrimaryBackup,
    /// Every member.
    FullReplication,
    /// A majority of members.
    QuorumBased,
}

impl ReplicationMode {
    /// Canonical config-file name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SingleCopy => "single_copy",
            Self::PrimaryBackup => "primary_backup",
            Self::FullReplication => "full_replication",
            Self::QuorumBased => "quorum_based",
        }
    }

    /// Number of copies this mode keeps in a cluster of the given size,
    /// never more than the cluster holds.
    #[must_use]
    pub fn replica_count(&self, cluster_size: usize) -> usize {
        let copies = match self {
            Self::SingleCopy => 1,
            Self::PrimaryBackup => 2,
            Self::FullReplication => cluster_size,
            Self::QuorumBased => cluster_size / 2 + 1,
        };
        copies.min(cluster_size)
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ReplicationMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_copy" => Ok(Self::SingleCopy),
            "primary_backup" => Ok(Self::PrimaryBackup),
            "full_replication" => Ok(Self::FullReplication),
            "quorum_based" => Ok(Self::QuorumBased),
            other => Err(ValidationError::InvalidConfig {
                reason: format!(
                    "unknown replication mode '{other}' (expected single_copy, \
                     primary_backup, full_replication or quorum_based)"
                ),
            }),
        }
    }
}

/// Assigns atoms to the members that should hold them.
///
/// Implementations must be deterministic for the schemes that promise
/// stability (hash and type based placement must agree across nodes
/// given the same membership).
pub trait AtomPlacement: Send + Sync {
    /// Returns the set of members that should hold `atom`. An empty
    /// membership yields an empty set.
    fn assign(&self, atom: &Atom, members: &[MemberInfo]) -> HashSet<NodeId>;
}

/// Policy-driven [`AtomPlacement`]: a [`PartitionScheme`] picks the
/// primary, a [`ReplicationMode`] widens to the replica set. Replicas
/// are the members following the primary in id order, so every node
/// computes the same set from the same membership.
///
/// # Examples
///
/// ```
/// use cogmesh::partition::{AtomPlacement, PartitionScheme, PolicyPlacement, ReplicationMode};
/// use cogmesh::{Atom, AtomType, MemberInfo, NodeId};
///
/// let placement = PolicyPlacement::new(
///     PartitionScheme::HashBased,
///     ReplicationMode::FullReplication,
/// );
/// let members = vec![
///     MemberInfo::new(NodeId::new("a").unwrap(), "10.0.0.1", 7500),
///     MemberInfo::new(NodeId::new("b").unwrap(), "10.0.0.2", 7500),
/// ];
/// let atom = Atom::node(AtomType::Concept, "everywhere").unwrap();
/// assert_eq!(placement.assign(&atom, &members).len(), 2);
/// ```
#[derive(Debug)]
pub struct PolicyPlacement {
    scheme: PartitionScheme,
    mode: ReplicationMode,
    cursor: AtomicUsize,
}

impl PolicyPlacement {
    /// Creates a placement policy.
    #[must_use]
    pub const fn new(scheme: PartitionScheme, mode: ReplicationMode) -> Self {
        Self {
            scheme,
            mode,
            cursor: AtomicUsize::new(0),
        }
    }

    /// The configured partition scheme.
    #[must_use]
    pub const fn scheme(&self) -> PartitionScheme {
        self.scheme
    }

    /// The configured replication mode.
    #[must_use]
    pub const fn mode(&self) -> ReplicationMode {
        self.mode
    }

    fn primary_index(&self, atom: &Atom, ranked: &[&MemberInfo]) -> usize {
        match self.scheme {
            PartitionScheme::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % ranked.len()
            }
            PartitionScheme::HashBased => {
                let handle = atom.handle();
                digest_index(handle.as_bytes(), ranked.len())
            }
            PartitionScheme::TypeBased => {
                let digest = blake3::hash(atom.atom_type().name().as_bytes());
                digest_index(digest.as_bytes(), ranked.len())
            }
            PartitionScheme::LoadBalanced => ranked
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.load_factor.total_cmp(&b.load_factor))
                .map_or(0, |(index, _)| index),
        }
    }
}

impl AtomPlacement for PolicyPlacement {
    fn assign(&self, atom: &Atom, members: &[MemberInfo]) -> HashSet<NodeId> {
        if members.is_empty() {
            return HashSet::new();
        }

        let mut ranked: Vec<&MemberInfo> = members.iter().collect();
        ranked.sort_by(|a, b| a.id.cmp(&b.id));

        let primary = self.primary_index(atom, &ranked);
        let copies = self.mode.replica_count(ranked.len());
        (0..copies)
            .map(|offset| ranked[(primary + offset) % ranked.len()].id.clone())
            .collect()
    }
}

/// Maps the first eight digest bytes onto a member index.
fn digest_index(digest: &[u8; 32], len: usize) -> usize {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(prefix) % len as u64) as usize
}
