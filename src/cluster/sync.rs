//! Sync operations and the delivery machinery around them.
//!
//! Every local mutation becomes one immutable [`SyncOperation`] stamped
//! with the originating node's vector clock. Delivery is at-least-once:
//! the pending queue retries failed sends a bounded number of times, and
//! receivers drop duplicate operation ids, because merging the same
//! evidence twice would double-count it.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atom::Handle;
use crate::clock::VectorClock;
use crate::cluster::member::NodeId;
use crate::cluster::protocol::AtomData;

/// How many recently applied operation ids a node remembers.
pub const SEEN_OPS_CAP: usize = 4096;

/// Unique identifier of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncOpId(Uuid);

impl SyncOpId {
    /// Creates a new random operation ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an operation ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SyncOpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a sync operation does to its atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// Insert the atom (merging truth if it already exists).
    Add,
    /// Replace the atom's truth value.
    Update,
    /// Remove the atom.
    Remove,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// One replicated mutation.
///
/// Immutable once created; the id makes redelivery detectable and the
/// clock records the causal context the mutation was made in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique id, used by receivers to drop redeliveries.
    pub id: SyncOpId,
    /// What this operation does.
    #[serde(rename = "operation_type")]
    pub kind: SyncKind,
    /// The atom being mutated.
    #[serde(rename = "atom_handle")]
    pub handle: Handle,
    /// Originating node.
    #[serde(rename = "source_node")]
    pub source: NodeId,
    /// Wall-clock time at the origin.
    pub timestamp: DateTime<Utc>,
    /// Atom payload; present for add and update, absent for remove.
    #[serde(rename = "atom_data", default, skip_serializing_if = "Option::is_none")]
    pub atom: Option<AtomData>,
    /// Origin's vector clock after stamping this operation.
    #[serde(rename = "vector_clock")]
    pub clock: VectorClock,
}

impl SyncOperation {
    /// Creates an add operation.
    #[must_use]
    pub fn add(atom: AtomData, source: NodeId, clock: VectorClock) -> Self {
        Self {
            id: SyncOpId::new(),
            kind: SyncKind::Add,
            handle: atom.handle,
            source,
            timestamp: Utc::now(),
            atom: Some(atom),
            clock,
        }
    }

    /// Creates a truth-value update operation.
    #[must_use]
    pub fn update(atom: AtomData, source: NodeId, clock: VectorClock) -> Self {
        Self {
            id: SyncOpId::new(),
            kind: SyncKind::Update,
            handle: atom.handle,
            source,
            timestamp: Utc::now(),
            atom: Some(atom),
            clock,
        }
    }

    /// Creates a remove operation.
    #[must_use]
    pub fn remove(handle: Handle, source: NodeId, clock: VectorClock) -> Self {
        Self {
            id: SyncOpId::new(),
            kind: SyncKind::Remove,
            handle,
            source,
            timestamp: Utc::now(),
            atom: None,
            clock,
        }
    }
}

/// A queued delivery: one operation and where it still has to go.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// The operation to deliver.
    pub op: SyncOperation,
    /// Remaining target nodes; `None` means every current member.
    pub targets: Option<Vec<NodeId>>,
    /// Delivery attempts already made.
    pub attempts: u32,
}

/// Outbound queue of not-yet-broadcast operations.
///
/// The replication observer pushes from mutation call sites; only the
/// sync loop drains. Pushing never blocks on network activity.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<VecDeque<PendingDelivery>>,
}

impl PendingQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a fresh operation addressed to all members.
    pub fn push(&self, op: SyncOperation) {
        let mut queue = self.lock();
        queue.push_back(PendingDelivery {
            op,
            targets: None,
            attempts: 0,
        });
    }

    /// Re-enqueues a delivery that failed for some of its targets.
    pub fn push_retry(&self, delivery: PendingDelivery) {
        let mut queue = self.lock();
        queue.push_back(delivery);
    }

    /// Takes everything currently queued.
    #[must_use]
    pub fn drain(&self) -> Vec<PendingDelivery> {
        let mut queue = self.lock();
        queue.drain(..).collect()
    }

    /// Ids of every queued operation, in queue order.
    #[must_use]
    pub fn op_ids(&self) -> Vec<SyncOpId> {
        self.lock().iter().map(|delivery| delivery.op.id).collect()
    }

    /// Number of queued deliveries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingDelivery>> {
        // A panicked pusher leaves the queue itself intact.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded ring of recently applied operation ids.
///
/// Truth merge accumulates evidence, so applying a redelivered operation
/// twice is not harmless. The ring bounds memory while keeping enough
/// history to cover realistic redelivery windows.
#[derive(Debug)]
pub struct SeenOps {
    cap: usize,
    inner: Mutex<SeenInner>,
}

#[derive(Debug, Default)]
struct SeenInner {
    order: VecDeque<SyncOpId>,
    ids: HashSet<SyncOpId>,
}

impl SeenOps {
    /// Creates a ring remembering up to `cap` operation ids.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            inner: Mutex::new(SeenInner::default()),
        }
    }

    /// Records an id. Returns false if it was already present, in which
    /// case the caller should skip the operation.
    pub fn insert(&self, id: SyncOpId) -> bool {
        let mut inner = self.lock();
        if !inner.ids.insert(id) {
            return false;
        }
        inner.order.push_back(id);
        if inner.order.len() > self.cap {
            if let Some(evicted) = inner.order.pop_front() {
                inner.ids.remove(&evicted);
            }
        }
        true
    }

    /// Returns true if the id is currently remembered.
    #[must_use]
    pub fn contains(&self, id: SyncOpId) -> bool {
        self.lock().ids.contains(&id)
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// Returns true if nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SeenInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SeenOps {
    fn default() -> Self {
        Self::new(SEEN_OPS_CAP)
    }
}
