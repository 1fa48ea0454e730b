//! # cogmesh - A Replicated Atom-Space Knowledge Store
//!
//! cogmesh keeps hypergraph knowledge bases converged across a cluster of
//! cooperating agents. Atoms are content-addressed, carry probabilistic
//! truth values, and merge instead of duplicating; nodes replicate every
//! local mutation and resolve concurrent edits with a pluggable strategy.
//!
//! ## Core Concepts
//!
//! - **Atom**: A node (named) or link (referencing child atoms) in the
//!   knowledge hypergraph
//! - **Handle**: Content-derived identity; the same knowledge always has
//!   the same handle, on every node
//! - **TruthValue**: Strength and confidence with commutative merging
//! - **AtomSpace**: The deduplicating, indexed store with observer hooks
//! - **ClusterNode**: Heartbeats, membership, replication and conflict
//!   resolution over framed JSON on TCP
//!
//! ## Usage
//!
//! ```
//! use cogmesh::{Atom, AtomSpace, AtomType, TruthValue};
//!
//! let space = AtomSpace::new();
//!
//! // Insert two concepts and relate them.
//! let cat = space.add_atom(Atom::node(AtomType::Concept, "cat")?)?;
//! let animal = space.add_atom(Atom::node(AtomType::Concept, "animal")?)?;
//! space.add_atom(Atom::link(
//!     AtomType::Inheritance,
//!     vec![cat.handle(), animal.handle()],
//! )?)?;
//!
//! // Re-inserting identical content merges truth values instead of
//! // duplicating the atom.
//! let again = space.add_atom(Atom::node_with_tv(
//!     AtomType::Concept,
//!     "cat",
//!     TruthValue::simple(0.9, 0.8)?,
//! )?)?;
//! assert_eq!(again.handle(), cat.handle());
//! assert_eq!(space.atom_count()?, 3);
//! # Ok::<(), cogmesh::MeshError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// The knowledge store
pub mod atom;
pub mod error;
pub mod space;
pub mod storage;
pub mod truth;

// The cluster layer
pub mod clock;
pub mod cluster;
pub mod partition;

// Re-export primary types at crate root for convenience
pub use atom::{Atom, AtomType, Handle};
pub use clock::{ClockOrdering, VectorClock};
pub use cluster::{
    ClusterConfig, ClusterEvent, ClusterNode, ConflictResolver, ConflictStrategy, MemberInfo,
    NodeId, NodeStatus, Resolution, SyncKind, SyncOpId, SyncOperation,
};
pub use error::{
    ClusterError, MeshError, MeshResult, ProtocolError, SpaceError, ValidationError,
};
pub use partition::{AtomPlacement, PartitionScheme, PolicyPlacement, ReplicationMode};
pub use space::{AtomEvent, AtomSpace, EventKind, EventOrigin, SpaceObserver};
pub use storage::{AtomStorage, MemoryStorage, StorageError};
pub use truth::TruthValue;
