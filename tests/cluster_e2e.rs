//! Cluster behavior over real loopback TCP: join and full sync,
//! replication in both directions, membership lifecycle, staleness
//! eviction, and conflict surfacing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;

use cogmesh::cluster::protocol::{read_frame, write_frame};
use cogmesh::cluster::{AtomData, ClusterMessage, JoinStatus};
use cogmesh::{
    Atom, AtomSpace, AtomType, ClusterConfig, ClusterError, ClusterEvent, ClusterNode,
    EventOrigin, MeshError, NodeId, SyncOperation, TruthValue, VectorClock,
};

fn concept(name: &str) -> Atom {
    Atom::node(AtomType::Concept, name).unwrap()
}

fn concept_with(name: &str, strength: f32, confidence: f32) -> Atom {
    Atom::node_with_tv(
        AtomType::Concept,
        name,
        TruthValue::simple(strength, confidence).unwrap(),
    )
    .unwrap()
}

async fn start_node(cluster: &str) -> ClusterNode {
    let space = Arc::new(AtomSpace::new());
    let node = ClusterNode::new(ClusterConfig::for_testing(cluster), space).unwrap();
    node.start().await.unwrap();
    node
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn two_nodes_converge_over_tcp() {
    let a = start_node("mesh").await;
    let b = start_node("mesh").await;

    // Data that predates the join arrives through the full sync pull.
    let existing = a.space().add_atom(concept("existing")).unwrap();

    b.join_cluster("127.0.0.1", a.advertised_port())
        .await
        .unwrap();
    assert!(b.space().contains(&existing.handle()).unwrap());
    assert_eq!(a.member_count().await, 1);
    assert_eq!(b.member_count().await, 1);

    // Mutations on either side reach the other through the sync loop.
    let from_b = b.space().add_atom(concept("from-b")).unwrap();
    wait_for("b's atom on a", || {
        a.space().contains(&from_b.handle()).unwrap()
    })
    .await;

    let from_a = a.space().add_atom(concept_with("from-a", 0.9, 0.8)).unwrap();
    wait_for("a's atom on b", || {
        b.space().contains(&from_a.handle()).unwrap()
    })
    .await;

    // Truth updates follow the same path.
    a.space()
        .set_truth_value(&from_b.handle(), TruthValue::simple(0.2, 0.9).unwrap())
        .unwrap();
    wait_for("updated truth on b", || {
        b.space()
            .get_atom(&from_b.handle())
            .unwrap()
            .is_some_and(|atom| (atom.tv().confidence() - 0.9).abs() < 1e-4)
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn membership_propagates_through_join_announcements() {
    let a = start_node("mesh").await;
    let b = start_node("mesh").await;
    let c = start_node("mesh").await;

    b.join_cluster("127.0.0.1", a.advertised_port())
        .await
        .unwrap();
    c.join_cluster("127.0.0.1", a.advertised_port())
        .await
        .unwrap();

    // c announced itself to b while joining, so all three know each
    // other without waiting for gossip.
    assert_eq!(a.member_count().await, 2);
    assert_eq!(b.member_count().await, 2);
    assert_eq!(c.member_count().await, 2);

    // A mutation on c reaches every member.
    let atom = c.space().add_atom(concept("broadcast")).unwrap();
    wait_for("atom on a", || a.space().contains(&atom.handle()).unwrap()).await;
    wait_for("atom on b", || b.space().contains(&atom.handle()).unwrap()).await;

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn join_by_hostname_attributes_seed_correctly() {
    let a = start_node("mesh").await;
    let b = start_node("mesh").await;

    let existing = a.space().add_atom(concept("existing")).unwrap();
    let events = b.space().subscribe();

    // The seed is addressed by name, not by the literal its member
    // record carries; attribution must not depend on the spelling.
    b.join_cluster("localhost", a.advertised_port())
        .await
        .unwrap();
    assert!(b.space().contains(&existing.handle()).unwrap());

    let adopted = events
        .try_iter()
        .find(|e| e.atom.handle() == existing.handle())
        .expect("full sync event");
    assert_eq!(
        adopted.origin,
        EventOrigin::Replicated {
            source: a.node_id().clone()
        }
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn join_rejected_on_cluster_id_mismatch() {
    let a = start_node("mesh-a").await;
    let b = start_node("mesh-b").await;

    let private = a.space().add_atom(concept("private")).unwrap();

    let err = b
        .join_cluster("127.0.0.1", a.advertised_port())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MeshError::Cluster(ClusterError::JoinRejected { .. })
    ));

    // Neither side adopted anything.
    assert_eq!(a.member_count().await, 0);
    assert_eq!(b.member_count().await, 0);
    assert!(!b.space().contains(&private.handle()).unwrap());
    assert!(b.space().is_empty().unwrap());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn departure_removes_member_exactly_once() {
    let a = start_node("mesh").await;
    let b = start_node("mesh").await;
    b.join_cluster("127.0.0.1", a.advertised_port())
        .await
        .unwrap();

    let events = a.subscribe_events();
    let b_id = b.node_id().clone();
    b.stop().await;

    let mut gone = false;
    for _ in 0..100 {
        if a.member_count().await == 0 {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "departed member still present");

    // A few heartbeat ticks later there is still exactly one exit event.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let exits = events
        .try_iter()
        .filter(|e| matches!(e, ClusterEvent::NodeLeft { node_id } if *node_id == b_id))
        .count();
    assert_eq!(exits, 1);

    a.stop().await;
}

#[tokio::test]
async fn silent_peer_evicted_exactly_once() {
    let a = start_node("mesh").await;
    let events = a.subscribe_events();
    let ghost = NodeId::new("ghost").unwrap();

    // A hand-rolled peer that joins and then never heartbeats.
    let mut stream = TcpStream::connect(("127.0.0.1", a.advertised_port()))
        .await
        .unwrap();
    write_frame(
        &mut stream,
        &ClusterMessage::JoinRequest {
            cluster_id: "mesh".to_string(),
            node_id: ghost.clone(),
            host: "127.0.0.1".to_string(),
            port: 1,
            timestamp: Utc::now(),
        },
    )
    .await
    .unwrap();
    let reply = read_frame(&mut stream).await.unwrap();
    assert!(matches!(
        reply,
        ClusterMessage::JoinResponse {
            status: JoinStatus::Accepted,
            ..
        }
    ));
    assert_eq!(a.member_count().await, 1);

    let mut evicted = false;
    for _ in 0..100 {
        if a.member_count().await == 0 {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(evicted, "silent member never evicted");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let exits = events
        .try_iter()
        .filter(|e| matches!(e, ClusterEvent::NodeLeft { node_id } if *node_id == ghost))
        .count();
    assert_eq!(exits, 1);

    a.stop().await;
}

#[tokio::test]
async fn concurrent_remote_edit_merges_and_surfaces() {
    let a = start_node("mesh").await;
    let events = a.subscribe_events();
    let ghost = NodeId::new("ghost").unwrap();

    let local = a
        .space()
        .add_atom(concept_with("contested", 0.9, 0.8))
        .unwrap();

    // A remote edit whose clock never saw ours: concurrent by definition.
    let incoming = concept_with("contested", 0.5, 0.5);
    let mut clock = VectorClock::new();
    clock.increment(&ghost);
    let op = SyncOperation::add(AtomData::from_atom(&incoming), ghost, clock);

    let mut stream = TcpStream::connect(("127.0.0.1", a.advertised_port()))
        .await
        .unwrap();
    write_frame(&mut stream, &ClusterMessage::Sync { op })
        .await
        .unwrap();

    wait_for("merged truth", || {
        a.space()
            .get_atom(&local.handle())
            .unwrap()
            .is_some_and(|atom| (atom.tv().confidence() - 1.0).abs() < 1e-6)
    })
    .await;

    // Default strategy keeps both bodies of evidence.
    let stored = a.space().get_atom(&local.handle()).unwrap().unwrap();
    assert!((stored.tv().strength() - 0.746_153_8).abs() < 1e-4);

    let conflicts = events
        .try_iter()
        .filter(
            |e| matches!(e, ClusterEvent::ConflictDetected { handle, .. } if *handle == local.handle()),
        )
        .count();
    assert_eq!(conflicts, 1);

    a.stop().await;
}

#[tokio::test]
async fn dependent_ops_replicate_in_queue_order() {
    let a = start_node("mesh").await;
    let b = start_node("mesh").await;
    b.join_cluster("127.0.0.1", a.advertised_port())
        .await
        .unwrap();

    // A node and a link referencing it, queued back to back; the link
    // can only land remotely if its child got there first.
    let child = a.space().add_atom(concept("premise")).unwrap();
    let link = a
        .space()
        .add_atom(Atom::link(AtomType::Inheritance, vec![child.handle()]).unwrap())
        .unwrap();

    wait_for("link on b", || b.space().contains(&link.handle()).unwrap()).await;
    assert!(b.space().contains(&child.handle()).unwrap());
    assert_eq!(b.space().get_incoming(&child.handle()).unwrap().len(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn link_arriving_before_its_child_heals() {
    let a = start_node("mesh").await;
    let ghost = NodeId::new("ghost").unwrap();

    let child = concept("premise");
    let link = Atom::link(AtomType::Inheritance, vec![child.handle()]).unwrap();

    let mut clock = VectorClock::new();
    clock.increment(&ghost);
    let child_op = SyncOperation::add(AtomData::from_atom(&child), ghost.clone(), clock.clone());
    clock.increment(&ghost);
    let link_op = SyncOperation::add(AtomData::from_atom(&link), ghost, clock);

    // Deliberately reversed on one connection: the link is read first,
    // parks until the child lands, and applies on the next retry pass.
    let mut stream = TcpStream::connect(("127.0.0.1", a.advertised_port()))
        .await
        .unwrap();
    write_frame(&mut stream, &ClusterMessage::Sync { op: link_op })
        .await
        .unwrap();
    write_frame(&mut stream, &ClusterMessage::Sync { op: child_op })
        .await
        .unwrap();

    wait_for("child on a", || {
        a.space().contains(&child.handle()).unwrap()
    })
    .await;
    wait_for("link healed on a", || {
        a.space().contains(&link.handle()).unwrap()
    })
    .await;

    a.stop().await;
}

#[tokio::test]
async fn join_during_pending_broadcast_applies_evidence_once() {
    // Slow the seed's drain so the join lands while the op is still
    // queued for broadcast.
    let space = Arc::new(AtomSpace::new());
    let config =
        ClusterConfig::for_testing("mesh").with_sync_interval(Duration::from_millis(400));
    let a = ClusterNode::new(config, space).unwrap();
    a.start().await.unwrap();
    let b = start_node("mesh").await;

    let atom = a.space().add_atom(concept_with("evidence", 0.9, 0.8)).unwrap();
    assert_eq!(a.pending_ops(), 1);

    b.join_cluster("127.0.0.1", a.advertised_port())
        .await
        .unwrap();
    // The atom came through the full sync.
    let synced = b.space().get_atom(&atom.handle()).unwrap().unwrap();
    assert!((synced.tv().confidence() - 0.8).abs() < 1e-6);

    // The queued broadcast drains afterwards; it must be recognized as
    // already covered by the snapshot, not merged in a second time.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let stored = b.space().get_atom(&atom.handle()).unwrap().unwrap();
    assert!((stored.tv().strength() - 0.9).abs() < 1e-4);
    assert!((stored.tv().confidence() - 0.8).abs() < 1e-4);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn duplicate_sync_delivery_applies_once() {
    let a = start_node("mesh").await;
    let ghost = NodeId::new("ghost").unwrap();

    let atom = concept_with("dup", 0.6, 0.5);
    let mut clock = VectorClock::new();
    clock.increment(&ghost);
    let op = SyncOperation::add(AtomData::from_atom(&atom), ghost, clock);

    let mut stream = TcpStream::connect(("127.0.0.1", a.advertised_port()))
        .await
        .unwrap();
    write_frame(&mut stream, &ClusterMessage::Sync { op: op.clone() })
        .await
        .unwrap();
    write_frame(&mut stream, &ClusterMessage::Sync { op })
        .await
        .unwrap();

    wait_for("atom applied", || {
        a.space().contains(&atom.handle()).unwrap()
    })
    .await;

    // Give the duplicate time to be read and discarded, then confirm it
    // never merged the truth value up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = a.space().get_atom(&atom.handle()).unwrap().unwrap();
    assert!((stored.tv().confidence() - 0.5).abs() < 1e-6);

    a.stop().await;
}
