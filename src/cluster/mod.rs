//! Peer clustering: membership, replication, and conflict resolution.
//!
//! A [`ClusterNode`] wraps one [`crate::space::AtomSpace`] and keeps it
//! converged with the spaces of its peers. Local mutations are captured
//! through the space's event stream and pushed to every member as sync
//! operations; incoming operations are applied through a vector-clock
//! dominance check, with concurrent edits handed to the configured
//! [`ConflictResolver`].

/// Node configuration and tuning knobs.
pub mod config;
/// Member identity and liveness bookkeeping.
pub mod member;
/// The cluster node runtime and its background tasks.
pub mod node;
/// Wire messages and length-prefixed framing.
pub mod protocol;
/// Conflict strategies and resolution outcomes.
pub mod resolver;
/// Sync operations, delivery queueing, and duplicate suppression.
pub mod sync;

pub use config::ClusterConfig;
pub use member::{MemberInfo, NodeId, NodeStatus};
pub use node::{ClusterEvent, ClusterNode};
pub use protocol::{AtomData, ClusterMessage, JoinStatus};
pub use resolver::{ConflictResolver, ConflictStrategy, Resolution};
pub use sync::{SyncKind, SyncOpId, SyncOperation};
