//! The cluster node runtime.
//!
//! A [`ClusterNode`] attaches to one [`AtomSpace`] and keeps it converged
//! with its peers. Three background tasks do the work: an accept loop
//! serving inbound connections, a heartbeat loop reporting liveness and
//! evicting silent members, and a sync loop draining locally originated
//! mutations to every member. Local mutations are captured by a space
//! observer; replicated applies carry a non-local origin so they are
//! never echoed back out.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::atom::{Atom, Handle};
use crate::clock::VectorClock;
use crate::cluster::config::ClusterConfig;
use crate::cluster::member::{MemberInfo, NodeId, NodeStatus};
use crate::cluster::protocol::{read_frame, write_frame, AtomData, ClusterMessage, JoinStatus};
use crate::cluster::resolver::{prefer_incoming, ConflictResolver, ConflictStrategy, Resolution};
use crate::cluster::sync::{PendingDelivery, PendingQueue, SeenOps, SyncKind, SyncOpId, SyncOperation};
use crate::error::{ClusterError, MeshError, MeshResult, ProtocolError, SpaceError};
use crate::space::{
    AtomEvent, AtomSpace, EventKind, EventOrigin, SpaceObserver, DEFAULT_SUBSCRIBER_CAPACITY,
};
use crate::truth::TruthValue;

/// Pending-queue depth at which the reported load factor saturates.
const QUEUE_LOAD_SCALE: f32 = 1000.0;

/// Membership and replication milestones, published to subscribers.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A node was added to the membership.
    NodeJoined {
        /// The new member.
        member: MemberInfo,
    },
    /// A node left, gracefully or by staleness eviction.
    NodeLeft {
        /// The departed member.
        node_id: NodeId,
    },
    /// A remote mutation arrived concurrent with local state.
    ConflictDetected {
        /// The contested atom.
        handle: Handle,
        /// Node the mutation came from.
        source: NodeId,
        /// Strategy that resolved it.
        strategy: ConflictStrategy,
    },
    /// A remote mutation was applied to the local space.
    SyncApplied {
        /// The applied operation.
        op_id: SyncOpId,
        /// What it did.
        kind: SyncKind,
        /// The mutated atom.
        handle: Handle,
        /// Node the mutation came from.
        source: NodeId,
    },
}

/// Bounded fan-out of cluster events, mirroring the space's subscriber
/// channels: non-blocking sends, slow subscribers lose events.
#[derive(Debug, Default)]
struct EventHub {
    subscribers: Mutex<Vec<Sender<ClusterEvent>>>,
    dropped: AtomicU64,
}

impl EventHub {
    fn subscribe(&self, capacity: usize) -> Receiver<ClusterEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.lock().push(tx);
        rx
    }

    fn publish(&self, event: &ClusterEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<ClusterEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared between the node handle and its background tasks.
#[derive(Debug)]
struct NodeShared {
    config: ClusterConfig,
    space: Arc<AtomSpace>,
    members: RwLock<HashMap<NodeId, MemberInfo>>,
    clock: Mutex<VectorClock>,
    pending: PendingQueue,
    seen: SeenOps,
    resolver: ConflictResolver,
    status: RwLock<NodeStatus>,
    advertised_port: AtomicU16,
    events: EventHub,
    /// One outbound connection per peer; frames written in queue order
    /// are applied in that order at the other end.
    conns: AsyncMutex<HashMap<NodeId, TcpStream>>,
    /// Replicated operations waiting for an atom that has not arrived
    /// yet, with the retry attempts already made.
    deferred: Mutex<VecDeque<(SyncOperation, u32)>>,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
}

/// What applying one replicated operation did to the local space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyOutcome {
    /// The space changed.
    Applied,
    /// Nothing to do.
    NoEffect,
    /// Blocked on an atom that has not arrived yet; retried later.
    Deferred,
}

impl NodeShared {
    fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    fn lock_clock(&self) -> std::sync::MutexGuard<'_, VectorClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_deferred(&self) -> std::sync::MutexGuard<'_, VecDeque<(SyncOperation, u32)>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This node's own membership record, as peers should see it.
    fn self_member(&self) -> MemberInfo {
        let mut member = MemberInfo::new(
            self.node_id().clone(),
            self.config.host.clone(),
            self.advertised_port.load(Ordering::SeqCst),
        );
        member.atomspace_size = self.space.atom_count().unwrap_or(0) as u64;
        member.load_factor = (self.pending.len() as f32 / QUEUE_LOAD_SCALE).min(1.0);
        member
    }

    /// Registers a member, returning true if it was previously unknown.
    async fn register_member(&self, member: MemberInfo) -> bool {
        let mut members = self.members.write().await;
        match members.get_mut(&member.id) {
            Some(known) => {
                known.host = member.host;
                known.port = member.port;
                known.touch(
                    member.status,
                    member.atomspace_size,
                    member.load_factor,
                    member.last_heartbeat,
                );
                false
            }
            None => {
                members.insert(member.id.clone(), member);
                true
            }
        }
    }

    /// Members currently eligible for sync traffic.
    async fn sync_targets(&self) -> Vec<MemberInfo> {
        let members = self.members.read().await;
        members
            .values()
            .filter(|m| m.status.can_sync())
            .cloned()
            .collect()
    }

    /// Evicts members whose heartbeats have lapsed. Removal from the map
    /// is what makes the `NodeLeft` event fire exactly once per peer.
    async fn evict_stale(&self) {
        let now = Utc::now();
        let timeout = self.config.staleness_timeout;
        let evicted: Vec<NodeId> = {
            let mut members = self.members.write().await;
            let stale: Vec<NodeId> = members
                .values()
                .filter(|m| m.is_stale(now, timeout))
                .map(|m| m.id.clone())
                .collect();
            for id in &stale {
                members.remove(id);
            }
            stale
        };

        for node_id in evicted {
            warn!(node = %node_id, "member evicted after heartbeat staleness");
            self.drop_connection(&node_id).await;
            self.events.publish(&ClusterEvent::NodeLeft { node_id });
        }
    }

    /// Closes the cached sync connection to a peer, if any.
    async fn drop_connection(&self, node_id: &NodeId) {
        self.conns.lock().await.remove(node_id);
    }

    /// Writes one sync frame on the persistent connection to a member,
    /// dialing on first use. A stale connection is dropped and redialed
    /// once before the delivery counts as failed.
    async fn send_ordered(&self, member: &MemberInfo, message: &ClusterMessage) -> MeshResult<()> {
        let mut conns = self.conns.lock().await;
        if let Some(stream) = conns.get_mut(&member.id) {
            match write_frame(stream, message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(peer = %member.id, error = %e, "sync connection lost, redialing");
                    conns.remove(&member.id);
                }
            }
        }

        let mut stream = dial(&member.addr(), self.config.dial_timeout).await?;
        write_frame(&mut stream, message).await?;
        conns.insert(member.id.clone(), stream);
        Ok(())
    }

    /// Dispatches one inbound message, returning the reply to send back
    /// on the same connection, if the message calls for one.
    async fn handle_message(
        self: &Arc<Self>,
        message: ClusterMessage,
    ) -> MeshResult<Option<ClusterMessage>> {
        match message {
            ClusterMessage::JoinRequest {
                cluster_id,
                node_id,
                host,
                port,
                ..
            } => {
                if cluster_id != self.config.cluster_id {
                    warn!(
                        joiner = %node_id,
                        theirs = %cluster_id,
                        ours = %self.config.cluster_id,
                        "rejecting join from foreign cluster"
                    );
                    return Ok(Some(ClusterMessage::JoinResponse {
                        status: JoinStatus::Rejected,
                        responder: self.node_id().clone(),
                        cluster_nodes: Vec::new(),
                    }));
                }

                let mut snapshot = vec![self.self_member()];
                snapshot.extend(
                    self.members
                        .read()
                        .await
                        .values()
                        .filter(|m| m.id != node_id)
                        .cloned(),
                );

                let member = MemberInfo::new(node_id.clone(), host, port);
                if self.register_member(member.clone()).await {
                    info!(joiner = %node_id, "node joined the cluster");
                    self.events.publish(&ClusterEvent::NodeJoined { member });
                }

                Ok(Some(ClusterMessage::JoinResponse {
                    status: JoinStatus::Accepted,
                    responder: self.node_id().clone(),
                    cluster_nodes: snapshot,
                }))
            }

            ClusterMessage::Heartbeat {
                node_id,
                status,
                atomspace_size,
                load_factor,
                timestamp,
            } => {
                let mut members = self.members.write().await;
                match members.get_mut(&node_id) {
                    Some(member) => member.touch(status, atomspace_size, load_factor, timestamp),
                    None => debug!(node = %node_id, "heartbeat from unknown member ignored"),
                }
                Ok(None)
            }

            ClusterMessage::Sync { op } => {
                self.apply_sync_op(op).await?;
                Ok(None)
            }

            ClusterMessage::Departure { node_id, .. } => {
                let removed = self.members.write().await.remove(&node_id).is_some();
                if removed {
                    info!(node = %node_id, "member departed");
                    self.drop_connection(&node_id).await;
                    self.events.publish(&ClusterEvent::NodeLeft { node_id });
                }
                Ok(None)
            }

            ClusterMessage::FullSyncRequest { node_id } => {
                debug!(requester = %node_id, "serving full sync");
                // Queued ids are captured before the export: anything
                // queued at that point has already mutated the space, so
                // every suppressed operation is covered by the atoms.
                let pending_ops = self.pending.op_ids();
                let atoms = self
                    .space
                    .export_atoms()?
                    .iter()
                    .map(AtomData::from_atom)
                    .collect();
                let vector_clock = self.lock_clock().clone();
                Ok(Some(ClusterMessage::FullSyncResponse {
                    atoms,
                    vector_clock,
                    pending_ops,
                }))
            }

            ClusterMessage::VoteRequest {
                op_id,
                atom_handle,
                local_tv,
                incoming_tv,
                node_id,
            } => {
                // Vote from this node's perspective: compare against our
                // own copy of the atom when we hold one, otherwise
                // against the asker's local truth.
                let base = self
                    .space
                    .get_atom(&atom_handle)?
                    .map_or(local_tv, |atom| atom.tv().clone());
                let vote = prefer_incoming(&base, &incoming_tv);
                debug!(op = %op_id, asker = %node_id, vote, "casting conflict vote");
                Ok(Some(ClusterMessage::VoteResponse {
                    op_id,
                    prefer_incoming: vote,
                    node_id: self.node_id().clone(),
                }))
            }

            // Responses ride the connection that carried their request;
            // one arriving here is a protocol violation.
            ClusterMessage::JoinResponse { .. } => Err(ProtocolError::UnexpectedMessage {
                context: "join response on server connection",
            }
            .into()),
            ClusterMessage::FullSyncResponse { .. } => Err(ProtocolError::UnexpectedMessage {
                context: "full sync response on server connection",
            }
            .into()),
            ClusterMessage::VoteResponse { .. } => Err(ProtocolError::UnexpectedMessage {
                context: "vote response on server connection",
            }
            .into()),
        }
    }

    /// The receive path for one replicated mutation.
    async fn apply_sync_op(self: &Arc<Self>, op: SyncOperation) -> MeshResult<()> {
        if !self.seen.insert(op.id) {
            debug!(op = %op.id, source = %op.source, "duplicate sync operation ignored");
            return Ok(());
        }

        // Dominance is judged against the clock as it was before this
        // operation's knowledge is folded in.
        let (local_clock, dominates) = {
            let mut clock = self.lock_clock();
            let snapshot = clock.clone();
            let dominates = op.clock.dominates(&snapshot);
            clock.merge(&op.clock);
            (snapshot, dominates)
        };

        let local_atom = self.space.get_atom(&op.handle)?;

        let outcome = match (dominates, local_atom) {
            // Causally clean, or nothing local to conflict with.
            (true, _) | (false, None) => self.apply_direct(&op)?,
            // The remote clock does not account for everything we know
            // about an atom we hold: a genuine conflict.
            (false, Some(local_atom)) => {
                self.events.publish(&ClusterEvent::ConflictDetected {
                    handle: op.handle,
                    source: op.source.clone(),
                    strategy: self.resolver.strategy(),
                });
                if self.resolve_conflict(&op, &local_atom, &local_clock).await? {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::NoEffect
                }
            }
        };

        match outcome {
            ApplyOutcome::Applied => {
                self.events.publish(&ClusterEvent::SyncApplied {
                    op_id: op.id,
                    kind: op.kind,
                    handle: op.handle,
                    source: op.source,
                });
            }
            ApplyOutcome::Deferred => {
                debug!(
                    op = %op.id,
                    handle = %op.handle,
                    "sync operation waits for a missing dependency"
                );
                self.lock_deferred().push_back((op, 0));
            }
            ApplyOutcome::NoEffect => {}
        }
        Ok(())
    }

    /// Retries operations that arrived before the atoms they depend on,
    /// in arrival order. A still-blocked operation goes back with one
    /// more attempt on its count, up to the sync retry limit.
    fn retry_deferred(&self) {
        let waiting: Vec<(SyncOperation, u32)> = {
            let mut deferred = self.lock_deferred();
            deferred.drain(..).collect()
        };

        for (op, attempts) in waiting {
            match self.apply_direct(&op) {
                Ok(ApplyOutcome::Applied) => {
                    self.events.publish(&ClusterEvent::SyncApplied {
                        op_id: op.id,
                        kind: op.kind,
                        handle: op.handle,
                        source: op.source,
                    });
                }
                Ok(ApplyOutcome::NoEffect) => {}
                Ok(ApplyOutcome::Deferred) => {
                    let attempts = attempts + 1;
                    if attempts >= self.config.sync_retry_limit {
                        warn!(
                            op = %op.id,
                            handle = %op.handle,
                            attempts,
                            "dropping sync operation still blocked after retries"
                        );
                    } else {
                        self.lock_deferred().push_back((op, attempts));
                    }
                }
                Err(e) => warn!(op = %op.id, error = %e, "deferred sync operation failed"),
            }
        }
    }

    /// Runs the configured strategy over one conflicted operation and
    /// applies its outcome. Returns whether the space changed.
    async fn resolve_conflict(
        self: &Arc<Self>,
        op: &SyncOperation,
        local_atom: &Atom,
        local_clock: &VectorClock,
    ) -> MeshResult<bool> {
        let incoming_tv = op
            .atom
            .as_ref()
            .map(|data| TruthValue::simple(data.truth_strength, data.truth_confidence))
            .transpose()
            .map_err(MeshError::from)?;

        let resolution =
            self.resolver
                .resolve(local_atom, incoming_tv.as_ref(), local_clock, &op.clock);
        debug!(
            op = %op.id,
            handle = %op.handle,
            strategy = %self.resolver.strategy(),
            ?resolution,
            "resolving concurrent mutation"
        );

        let replicated = EventOrigin::Replicated {
            source: op.source.clone(),
        };
        match resolution {
            Resolution::ApplyIncoming => self.apply_incoming_wins(op),
            Resolution::KeepLocal => Ok(false),
            Resolution::Merge(tv) => {
                self.space
                    .set_truth_value_with_origin(&op.handle, tv, replicated)?;
                Ok(true)
            }
            Resolution::NeedsVote => {
                let Some(incoming) = incoming_tv else {
                    // A conflicted remove has no truth value to vote on;
                    // the surviving update outweighs it.
                    debug!(op = %op.id, "conflicted remove kept local atom");
                    return Ok(false);
                };
                match self.run_vote(op, local_atom.tv(), &incoming).await {
                    Some(true) => self.apply_incoming_wins(op),
                    Some(false) => Ok(false),
                    // No majority inside the window: merge so both bodies
                    // of evidence survive.
                    None => {
                        let merged = local_atom.tv().merge(&incoming);
                        self.space
                            .set_truth_value_with_origin(&op.handle, merged, replicated)?;
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Applies an uncontested operation with the space's own semantics:
    /// adds merge into duplicates, updates replace (inserting if the
    /// atom is missing), removes respect referential integrity. An
    /// operation whose dependencies have not arrived yet is deferred
    /// rather than dropped, so out-of-order delivery heals.
    fn apply_direct(&self, op: &SyncOperation) -> MeshResult<ApplyOutcome> {
        let origin = EventOrigin::Replicated {
            source: op.source.clone(),
        };
        match (op.kind, &op.atom) {
            (SyncKind::Add, Some(data)) => {
                let atom = data.to_atom()?;
                self.insert_replicated(atom, origin, op)
            }
            (SyncKind::Update, Some(data)) => {
                let atom = data.to_atom()?;
                if self.space.contains(&op.handle)? {
                    self.space
                        .set_truth_value_with_origin(&op.handle, atom.tv().clone(), origin)?;
                    Ok(ApplyOutcome::Applied)
                } else {
                    // Update for an atom we never saw: treat as insert so
                    // the cluster still converges.
                    self.insert_replicated(atom, origin, op)
                }
            }
            (SyncKind::Remove, _) => {
                if self.space.remove_atom_with_origin(&op.handle, origin)? {
                    Ok(ApplyOutcome::Applied)
                } else if self.space.contains(&op.handle)? {
                    // Still referenced by a link whose removal has not
                    // arrived yet.
                    Ok(ApplyOutcome::Deferred)
                } else {
                    debug!(op = %op.id, handle = %op.handle, "replicated remove had no effect");
                    Ok(ApplyOutcome::NoEffect)
                }
            }
            (SyncKind::Add | SyncKind::Update, None) => {
                warn!(op = %op.id, "sync operation missing atom payload");
                Ok(ApplyOutcome::NoEffect)
            }
        }
    }

    /// Inserts one replicated atom; a link whose child is not here yet
    /// is reported as deferred instead of failing.
    fn insert_replicated(
        &self,
        atom: Atom,
        origin: EventOrigin,
        op: &SyncOperation,
    ) -> MeshResult<ApplyOutcome> {
        match self.space.add_atom_with_origin(atom, origin) {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(SpaceError::MissingChild { handle }) => {
                debug!(op = %op.id, child = %handle, "link arrived before its child");
                Ok(ApplyOutcome::Deferred)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Applies an operation the resolver decided should win outright:
    /// the incoming truth value replaces the local one.
    fn apply_incoming_wins(&self, op: &SyncOperation) -> MeshResult<bool> {
        let origin = EventOrigin::Replicated {
            source: op.source.clone(),
        };
        match (op.kind, &op.atom) {
            (SyncKind::Add | SyncKind::Update, Some(data)) => {
                let atom = data.to_atom()?;
                if self.space.contains(&op.handle)? {
                    self.space
                        .set_truth_value_with_origin(&op.handle, atom.tv().clone(), origin)?;
                } else {
                    self.space.add_atom_with_origin(atom, origin)?;
                }
                Ok(true)
            }
            (SyncKind::Remove, _) => Ok(self.space.remove_atom_with_origin(&op.handle, origin)?),
            (SyncKind::Add | SyncKind::Update, None) => {
                warn!(op = %op.id, "sync operation missing atom payload");
                Ok(false)
            }
        }
    }

    /// Asks every sync-eligible peer to vote on a conflict. Returns the
    /// majority preference, or `None` when no majority formed inside the
    /// vote window.
    async fn run_vote(
        self: &Arc<Self>,
        op: &SyncOperation,
        local_tv: &TruthValue,
        incoming_tv: &TruthValue,
    ) -> Option<bool> {
        let peers = self.sync_targets().await;
        let electorate = peers.len() + 1;

        let mut prefer_votes = usize::from(prefer_incoming(local_tv, incoming_tv));
        let mut keep_votes = 1 - prefer_votes;

        let request = ClusterMessage::VoteRequest {
            op_id: op.id,
            atom_handle: op.handle,
            local_tv: local_tv.clone(),
            incoming_tv: incoming_tv.clone(),
            node_id: self.node_id().clone(),
        };

        let mut ballots = JoinSet::new();
        for peer in peers {
            let request = request.clone();
            let dial_timeout = self.config.dial_timeout;
            ballots.spawn(async move { request_vote(&peer.addr(), dial_timeout, &request).await });
        }

        let deadline = tokio::time::Instant::now() + self.config.vote_timeout;
        while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, ballots.join_next()).await {
            match joined {
                Ok(Some(prefer)) => {
                    if prefer {
                        prefer_votes += 1;
                    } else {
                        keep_votes += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "vote task failed"),
            }
            if prefer_votes * 2 > electorate || keep_votes * 2 > electorate {
                break;
            }
        }
        ballots.abort_all();

        debug!(
            op = %op.id,
            prefer = prefer_votes,
            keep = keep_votes,
            electorate,
            "conflict vote concluded"
        );
        if prefer_votes * 2 > electorate {
            Some(true)
        } else if keep_votes * 2 > electorate {
            Some(false)
        } else {
            None
        }
    }

    /// Drains the pending queue, sending each operation to its remaining
    /// targets over the per-peer connections, so a peer receives this
    /// node's operations in the order they were queued. Failed deliveries
    /// are re-queued with the failed subset until the retry limit, then
    /// dropped.
    async fn drain_pending(&self) {
        let deliveries = self.pending.drain();
        if deliveries.is_empty() {
            return;
        }

        let members = self.sync_targets().await;
        for delivery in deliveries {
            let targets: Vec<&MemberInfo> = match &delivery.targets {
                None => members.iter().collect(),
                Some(ids) => members.iter().filter(|m| ids.contains(&m.id)).collect(),
            };

            let mut failed = Vec::new();
            for member in targets {
                let message = ClusterMessage::Sync {
                    op: delivery.op.clone(),
                };
                if let Err(e) = self.send_ordered(member, &message).await {
                    debug!(peer = %member.id, error = %e, "sync delivery failed");
                    failed.push(member.id.clone());
                }
            }

            if !failed.is_empty() {
                let attempts = delivery.attempts + 1;
                if attempts >= self.config.sync_retry_limit {
                    warn!(
                        op = %delivery.op.id,
                        peers = ?failed,
                        attempts,
                        "dropping sync operation after retry limit"
                    );
                } else {
                    self.pending.push_retry(PendingDelivery {
                        op: delivery.op,
                        targets: Some(failed),
                        attempts,
                    });
                }
            }
        }
    }

    /// One heartbeat tick: report to every member, then evict the silent.
    async fn heartbeat_tick(&self) {
        let me = self.self_member();
        let message = ClusterMessage::Heartbeat {
            node_id: me.id.clone(),
            status: *self.status.read().await,
            atomspace_size: me.atomspace_size,
            load_factor: me.load_factor,
            timestamp: Utc::now(),
        };

        for member in self.sync_targets().await {
            if let Err(e) = send_message(&member.addr(), self.config.dial_timeout, &message).await {
                debug!(peer = %member.id, error = %e, "heartbeat delivery failed");
            }
        }

        self.evict_stale().await;
    }
}

/// Space observer that turns locally originated mutations into sync
/// operations. Holds the node state weakly so a dropped node does not
/// stay alive through its own space registration.
struct ReplicationObserver {
    shared: Weak<NodeShared>,
}

impl SpaceObserver for ReplicationObserver {
    fn on_event(&self, event: &AtomEvent) {
        if !event.origin.is_local() {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let clock = {
            let mut clock = shared.lock_clock();
            clock.increment(shared.node_id());
            clock.clone()
        };

        let source = shared.node_id().clone();
        let op = match event.kind {
            EventKind::AtomAdded => {
                SyncOperation::add(AtomData::from_atom(&event.atom), source, clock)
            }
            EventKind::TruthValueChanged => {
                SyncOperation::update(AtomData::from_atom(&event.atom), source, clock)
            }
            EventKind::AtomRemoved => SyncOperation::remove(event.atom.handle(), source, clock),
        };
        shared.pending.push(op);
    }
}

/// One node in a replicating atom-space cluster.
///
/// Wraps a shared [`AtomSpace`]; the node captures the space's local
/// mutations for replication, so exactly one node should be attached to
/// a given space. The node is single-use: construct, [`start`], then
/// [`stop`]; build a fresh node for a new lifecycle.
///
/// [`start`]: ClusterNode::start
/// [`stop`]: ClusterNode::stop
#[derive(Debug)]
pub struct ClusterNode {
    shared: Arc<NodeShared>,
    accept_task: RwLock<Option<JoinHandle<()>>>,
    heartbeat_task: RwLock<Option<JoinHandle<()>>>,
    sync_task: RwLock<Option<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Creates a node over the given space and registers its replication
    /// observer.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` if the configuration is
    /// unusable.
    pub fn new(config: ClusterConfig, space: Arc<AtomSpace>) -> MeshResult<Self> {
        config.validate()?;

        let resolver = ConflictResolver::new(config.strategy);
        let advertised_port = AtomicU16::new(config.port);
        let shared = Arc::new(NodeShared {
            config,
            space,
            members: RwLock::new(HashMap::new()),
            clock: Mutex::new(VectorClock::new()),
            pending: PendingQueue::new(),
            seen: SeenOps::default(),
            resolver,
            status: RwLock::new(NodeStatus::Initializing),
            advertised_port,
            events: EventHub::default(),
            conns: AsyncMutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            shutdown: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
        });

        shared.space.register_observer(Arc::new(ReplicationObserver {
            shared: Arc::downgrade(&shared),
        }));

        Ok(Self {
            shared,
            accept_task: RwLock::new(None),
            heartbeat_task: RwLock::new(None),
            sync_task: RwLock::new(None),
        })
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        self.shared.node_id()
    }

    /// The cluster this node belongs to.
    #[must_use]
    pub fn cluster_id(&self) -> &str {
        &self.shared.config.cluster_id
    }

    /// The space this node replicates.
    #[must_use]
    pub fn space(&self) -> &Arc<AtomSpace> {
        &self.shared.space
    }

    /// The configured conflict strategy.
    #[must_use]
    pub fn strategy(&self) -> ConflictStrategy {
        self.shared.resolver.strategy()
    }

    /// Port the node's listener is (or will be) reachable on. Becomes
    /// definitive after [`ClusterNode::start`] when configured port 0
    /// asked the OS for an ephemeral one.
    #[must_use]
    pub fn advertised_port(&self) -> u16 {
        self.shared.advertised_port.load(Ordering::SeqCst)
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> NodeStatus {
        *self.shared.status.read().await
    }

    /// Snapshot of known members.
    pub async fn members(&self) -> Vec<MemberInfo> {
        self.shared.members.read().await.values().cloned().collect()
    }

    /// Number of known members (excluding this node).
    pub async fn member_count(&self) -> usize {
        self.shared.members.read().await.len()
    }

    /// Snapshot of this node's vector clock.
    #[must_use]
    pub fn clock(&self) -> VectorClock {
        self.shared.lock_clock().clone()
    }

    /// Number of operations waiting to be broadcast.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.shared.pending.len()
    }

    /// Opens a cluster event subscription with the default capacity.
    #[must_use]
    pub fn subscribe_events(&self) -> Receiver<ClusterEvent> {
        self.shared.events.subscribe(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Binds the listener and spawns the accept, heartbeat and sync
    /// tasks.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::AlreadyRunning` if the node is past its
    /// initial state, or the bind failure as a protocol error.
    pub async fn start(&self) -> MeshResult<()> {
        {
            let mut status = self.shared.status.write().await;
            if *status != NodeStatus::Initializing {
                return Err(ClusterError::AlreadyRunning.into());
            }
            *status = NodeStatus::Active;
        }

        let bind_addr = format!("{}:{}", self.shared.config.host, self.shared.config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(ProtocolError::Io)?;
        let local_addr = listener.local_addr().map_err(ProtocolError::Io)?;
        self.shared
            .advertised_port
            .store(local_addr.port(), Ordering::SeqCst);

        info!(
            node = %self.node_id(),
            cluster = %self.cluster_id(),
            addr = %local_addr,
            strategy = %self.strategy(),
            "cluster node started"
        );

        *self.accept_task.write().await = Some(spawn_accept_loop(Arc::clone(&self.shared), listener));
        *self.heartbeat_task.write().await = Some(spawn_heartbeat_loop(Arc::clone(&self.shared)));
        *self.sync_task.write().await = Some(spawn_sync_loop(Arc::clone(&self.shared)));

        Ok(())
    }

    /// Joins an existing cluster through a seed node: sends the join
    /// request, adopts the returned membership, pulls the seed's full
    /// atom set, and announces itself to the other members.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::NotRunning` if called before `start`,
    /// `ClusterError::JoinRejected` on cluster id mismatch (membership
    /// is left unchanged), or a connection error if the seed is
    /// unreachable.
    pub async fn join_cluster(&self, seed_host: &str, seed_port: u16) -> MeshResult<()> {
        if *self.shared.status.read().await != NodeStatus::Active {
            return Err(ClusterError::NotRunning.into());
        }

        let seed_addr = format!("{seed_host}:{seed_port}");
        let mut stream = dial(&seed_addr, self.shared.config.dial_timeout).await?;

        let request = ClusterMessage::JoinRequest {
            cluster_id: self.cluster_id().to_string(),
            node_id: self.node_id().clone(),
            host: self.shared.config.host.clone(),
            port: self.advertised_port(),
            timestamp: Utc::now(),
        };
        write_frame(&mut stream, &request).await?;

        let reply = read_reply(&mut stream, &seed_addr, self.shared.config.dial_timeout).await?;
        let (seed_id, adopted) = match reply {
            ClusterMessage::JoinResponse {
                status: JoinStatus::Accepted,
                responder,
                cluster_nodes,
            } => (responder, cluster_nodes),
            ClusterMessage::JoinResponse {
                status: JoinStatus::Rejected,
                ..
            } => {
                warn!(seed = %seed_addr, "join rejected by seed");
                return Err(ClusterError::JoinRejected {
                    cluster_id: self.cluster_id().to_string(),
                }
                .into());
            }
            _ => {
                return Err(ProtocolError::UnexpectedMessage {
                    context: "join response",
                }
                .into())
            }
        };

        for member in &adopted {
            if member.id == *self.node_id() {
                continue;
            }
            if self.shared.register_member(member.clone()).await {
                self.shared.events.publish(&ClusterEvent::NodeJoined {
                    member: member.clone(),
                });
            }
        }
        info!(
            seed = %seed_addr,
            members = adopted.len(),
            "joined cluster, pulling full sync"
        );

        // Pull the seed's atom population over the same connection.
        write_frame(
            &mut stream,
            &ClusterMessage::FullSyncRequest {
                node_id: self.node_id().clone(),
            },
        )
        .await?;
        let reply = read_reply(&mut stream, &seed_addr, self.shared.config.dial_timeout).await?;
        let ClusterMessage::FullSyncResponse {
            atoms,
            vector_clock,
            pending_ops,
        } = reply
        else {
            return Err(ProtocolError::UnexpectedMessage {
                context: "full sync response",
            }
            .into());
        };

        // The seed will broadcast its queued operations to us shortly;
        // their effects are already inside this snapshot, so applying
        // them again would double-count their evidence.
        for op_id in pending_ops {
            self.shared.seen.insert(op_id);
        }

        let mut applied = 0usize;
        for data in &atoms {
            let atom = data.to_atom()?;
            self.shared.space.add_atom_with_origin(
                atom,
                EventOrigin::Replicated {
                    source: seed_id.clone(),
                },
            )?;
            applied += 1;
        }
        self.shared.lock_clock().merge(&vector_clock);
        info!(atoms = applied, "full sync applied");

        // Announce ourselves to the members the seed told us about, so
        // they heartbeat and sync back to us.
        let request = ClusterMessage::JoinRequest {
            cluster_id: self.cluster_id().to_string(),
            node_id: self.node_id().clone(),
            host: self.shared.config.host.clone(),
            port: self.advertised_port(),
            timestamp: Utc::now(),
        };
        for member in &adopted {
            if member.id == *self.node_id() || member.id == seed_id {
                continue;
            }
            match send_request(&member.addr(), self.shared.config.dial_timeout, &request).await {
                Ok(ClusterMessage::JoinResponse {
                    status: JoinStatus::Accepted,
                    ..
                }) => {}
                Ok(_) | Err(_) => {
                    debug!(peer = %member.id, "join announcement not acknowledged");
                }
            }
        }

        Ok(())
    }

    /// Stops the node: signals the tasks, waits for them, sends a
    /// best-effort departure to every member, and goes offline.
    /// Idempotent; stopping a node that never started just marks it
    /// offline.
    pub async fn stop(&self) {
        {
            let status = self.shared.status.read().await;
            if *status == NodeStatus::Offline {
                return;
            }
        }

        info!(node = %self.node_id(), "stopping cluster node");
        self.shared.shutdown_requested.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();

        for slot in [&self.accept_task, &self.heartbeat_task, &self.sync_task] {
            if let Some(task) = slot.write().await.take() {
                let _ = task.await;
            }
        }

        let farewell = ClusterMessage::Departure {
            node_id: self.node_id().clone(),
            timestamp: Utc::now(),
        };
        for member in self.shared.sync_targets().await {
            if let Err(e) =
                send_message(&member.addr(), self.shared.config.dial_timeout, &farewell).await
            {
                debug!(peer = %member.id, error = %e, "departure delivery failed");
            }
        }

        *self.shared.status.write().await = NodeStatus::Offline;
        info!(node = %self.node_id(), "cluster node stopped");
    }
}

fn spawn_accept_loop(shared: Arc<NodeShared>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shared.shutdown_requested.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(&shared, stream).await {
                                debug!(peer = %peer_addr, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                () = shared.shutdown.notified() => break,
            }
        }
        debug!("accept loop shut down");
    })
}

fn spawn_heartbeat_loop(shared: Arc<NodeShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shared.shutdown_requested.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(shared.config.heartbeat_interval) => {
                    shared.heartbeat_tick().await;
                }
                () = shared.shutdown.notified() => break,
            }
        }
        debug!("heartbeat loop shut down");
    })
}

fn spawn_sync_loop(shared: Arc<NodeShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shared.shutdown_requested.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(shared.config.sync_interval) => {
                    shared.retry_deferred();
                    shared.drain_pending().await;
                }
                () = shared.shutdown.notified() => break,
            }
        }
        debug!("sync loop shut down");
    })
}

/// Serves one inbound connection until the peer hangs up or shutdown.
async fn serve_connection(shared: &Arc<NodeShared>, mut stream: TcpStream) -> MeshResult<()> {
    loop {
        if shared.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        let message = tokio::select! {
            frame = read_frame(&mut stream) => match frame {
                Ok(message) => message,
                // Peer closed between frames.
                Err(ProtocolError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            },
            () = shared.shutdown.notified() => return Ok(()),
        };

        if let Some(reply) = shared.handle_message(message).await? {
            write_frame(&mut stream, &reply).await?;
        }
    }
}

async fn dial(addr: &str, timeout: std::time::Duration) -> Result<TcpStream, ClusterError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ClusterError::PeerUnreachable {
            node: addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ClusterError::DialTimeout {
            addr: addr.to_string(),
        }),
    }
}

async fn read_reply(
    stream: &mut TcpStream,
    addr: &str,
    timeout: std::time::Duration,
) -> MeshResult<ClusterMessage> {
    match tokio::time::timeout(timeout, read_frame(stream)).await {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ClusterError::PeerUnreachable {
            node: addr.to_string(),
            reason: "reply timed out".to_string(),
        }
        .into()),
    }
}

/// Fire-and-forget delivery of one message.
async fn send_message(
    addr: &str,
    timeout: std::time::Duration,
    message: &ClusterMessage,
) -> MeshResult<()> {
    let mut stream = dial(addr, timeout).await?;
    write_frame(&mut stream, message).await?;
    Ok(())
}

/// Request/response exchange on a fresh connection.
async fn send_request(
    addr: &str,
    timeout: std::time::Duration,
    message: &ClusterMessage,
) -> MeshResult<ClusterMessage> {
    let mut stream = dial(addr, timeout).await?;
    write_frame(&mut stream, message).await?;
    read_reply(&mut stream, addr, timeout).await
}

/// Collects one peer's ballot; `None` when the peer could not be asked.
async fn request_vote(
    addr: &str,
    timeout: std::time::Duration,
    request: &ClusterMessage,
) -> Option<bool> {
    match send_request(addr, timeout, request).await {
        Ok(ClusterMessage::VoteResponse {
            prefer_incoming, ..
        }) => Some(prefer_incoming),
        Ok(_) | Err(_) => None,
    }
}
