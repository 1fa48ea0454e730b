//! End-to-end store behavior through the public API: dedup with truth
//! merging, referential integrity, queries, event subscriptions, and the
//! in-memory persistence backend.

use std::sync::Arc;

use cogmesh::{
    Atom, AtomSpace, AtomStorage, AtomType, EventKind, EventOrigin, MemoryStorage, NodeId,
    TruthValue,
};

fn concept(name: &str) -> Atom {
    Atom::node(AtomType::Concept, name).unwrap()
}

#[test]
fn duplicate_insert_merges_instead_of_duplicating() {
    let space = AtomSpace::new();
    let first = space
        .add_atom(
            Atom::node_with_tv(
                AtomType::Concept,
                "cat",
                TruthValue::simple(0.9, 0.8).unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
    let merged = space
        .add_atom(
            Atom::node_with_tv(
                AtomType::Concept,
                "cat",
                TruthValue::simple(0.5, 0.5).unwrap(),
            )
            .unwrap(),
        )
        .unwrap();

    assert_eq!(merged.handle(), first.handle());
    assert_eq!(space.atom_count().unwrap(), 1);

    // Confidence-weighted average of the evidence, saturated confidence.
    assert!((merged.tv().strength() - 0.746_153_8).abs() < 1e-4);
    assert!((merged.tv().confidence() - 1.0).abs() < 1e-6);
}

#[test]
fn removal_blocked_until_referrers_go() {
    let space = AtomSpace::new();
    let cat = space.add_atom(concept("cat")).unwrap();
    let animal = space.add_atom(concept("animal")).unwrap();
    let isa = space
        .add_atom(Atom::link(AtomType::Inheritance, vec![cat.handle(), animal.handle()]).unwrap())
        .unwrap();
    let wrapped = space
        .add_atom(Atom::link(AtomType::List, vec![isa.handle()]).unwrap())
        .unwrap();

    // Nothing in the chain can go while something points at it.
    assert!(!space.remove_atom(&cat.handle()).unwrap());
    assert!(!space.remove_atom(&isa.handle()).unwrap());
    assert_eq!(space.atom_count().unwrap(), 4);

    // Unwinding from the top releases each layer in turn.
    assert!(space.remove_atom(&wrapped.handle()).unwrap());
    assert!(space.remove_atom(&isa.handle()).unwrap());
    assert!(space.remove_atom(&cat.handle()).unwrap());

    assert_eq!(space.atom_count().unwrap(), 1);
    assert_eq!(space.node_count().unwrap(), 1);
    assert_eq!(space.link_count().unwrap(), 0);
}

#[test]
fn queries_answer_by_type_name_and_incoming() {
    let space = AtomSpace::new();
    let water = space.add_atom(concept("water")).unwrap();
    let wet = space
        .add_atom(Atom::node(AtomType::Predicate, "wet").unwrap())
        .unwrap();
    let fact = space
        .add_atom(Atom::link(AtomType::Evaluation, vec![wet.handle(), water.handle()]).unwrap())
        .unwrap();
    space
        .add_atom(Atom::node(AtomType::Custom("GoalNode".to_string()), "hydrate").unwrap())
        .unwrap();

    assert_eq!(space.get_atoms_by_type(&AtomType::Concept).unwrap().len(), 1);
    assert_eq!(
        space
            .get_atoms_by_type(&AtomType::Custom("GoalNode".to_string()))
            .unwrap()
            .len(),
        1
    );

    let named = space.get_nodes_by_name("water", None).unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].handle(), water.handle());
    assert!(space
        .get_nodes_by_name("water", Some(&AtomType::Predicate))
        .unwrap()
        .is_empty());

    let incoming = space.get_incoming(&water.handle()).unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].handle(), fact.handle());
}

#[test]
fn export_replays_into_an_identical_space() {
    let space = AtomSpace::new();
    let a = space.add_atom(concept("a")).unwrap();
    let b = space.add_atom(concept("b")).unwrap();
    let pair = space
        .add_atom(Atom::link(AtomType::List, vec![a.handle(), b.handle()]).unwrap())
        .unwrap();
    let nested = space
        .add_atom(Atom::link(AtomType::List, vec![pair.handle()]).unwrap())
        .unwrap();
    space
        .set_truth_value(&b.handle(), TruthValue::simple(0.7, 0.6).unwrap())
        .unwrap();

    // Export promises children before referrers, so a straight replay
    // must never trip over a missing child.
    let replica = AtomSpace::new();
    for atom in space.export_atoms().unwrap() {
        replica.add_atom(atom).unwrap();
    }

    assert_eq!(replica.atom_count().unwrap(), 4);
    assert_eq!(replica.link_count().unwrap(), 2);
    assert!(replica.contains(&nested.handle()).unwrap());

    let restored = replica.get_atom(&b.handle()).unwrap().unwrap();
    assert!((restored.tv().strength() - 0.7).abs() < 1e-6);
}

#[test]
fn subscribers_see_mutations_in_order() {
    let space = AtomSpace::new();
    let events = space.subscribe();

    let atom = space.add_atom(concept("tracked")).unwrap();
    space
        .set_truth_value(&atom.handle(), TruthValue::simple(0.4, 0.3).unwrap())
        .unwrap();
    space.remove_atom(&atom.handle()).unwrap();

    let kinds: Vec<EventKind> = events.try_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::AtomAdded,
            EventKind::TruthValueChanged,
            EventKind::AtomRemoved
        ]
    );
}

#[test]
fn replication_origin_rides_events() {
    let space = AtomSpace::new();
    let events = space.subscribe();
    let source = NodeId::new("peer-1").unwrap();

    space
        .add_atom_with_origin(
            concept("imported"),
            EventOrigin::Replicated {
                source: source.clone(),
            },
        )
        .unwrap();
    space.add_atom(concept("native")).unwrap();

    let origins: Vec<EventOrigin> = events.try_iter().map(|e| e.origin).collect();
    assert_eq!(origins.len(), 2);
    assert!(matches!(&origins[0], EventOrigin::Replicated { source: s } if *s == source));
    assert!(origins[1].is_local());
}

#[test]
fn memory_backend_round_trips_a_space() {
    let space = AtomSpace::new();
    let cat = space.add_atom(concept("cat")).unwrap();
    let animal = space.add_atom(concept("animal")).unwrap();
    space
        .add_atom(Atom::link(AtomType::Inheritance, vec![cat.handle(), animal.handle()]).unwrap())
        .unwrap();

    let storage: Arc<dyn AtomStorage> = Arc::new(MemoryStorage::new());
    storage.open().unwrap();
    assert_eq!(storage.store_atomspace(&space).unwrap(), 3);

    let restored = AtomSpace::new();
    assert_eq!(storage.load_atomspace(&restored).unwrap(), 3);
    assert_eq!(restored.atom_count().unwrap(), 3);
    assert_eq!(restored.get_incoming(&cat.handle()).unwrap().len(), 1);

    storage.close().unwrap();
}
