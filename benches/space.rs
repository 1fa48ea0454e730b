use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use cogmesh::{Atom, AtomSpace, AtomType, Handle, TruthValue};

fn seeded_space(nodes: usize) -> (AtomSpace, Vec<Handle>) {
    let space = AtomSpace::new();
    let mut handles = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let atom = space
            .add_atom(Atom::node(AtomType::Concept, format!("concept-{i}")).unwrap())
            .unwrap();
        handles.push(atom.handle());
    }
    // Chain the nodes with inheritance links so incoming queries have
    // edges to walk.
    for pair in handles.windows(2) {
        space
            .add_atom(Atom::link(AtomType::Inheritance, vec![pair[0], pair[1]]).unwrap())
            .unwrap();
    }
    (space, handles)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("space_insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("distinct_nodes", |b| {
        b.iter_custom(|iters| {
            // Fresh space and pre-built atoms per sample so dedup never
            // kicks in and construction stays out of the timing.
            let space = AtomSpace::new();
            let atoms: Vec<Atom> = (0..iters)
                .map(|i| Atom::node(AtomType::Concept, format!("concept-{i}")).unwrap())
                .collect();

            let start = Instant::now();
            for atom in atoms {
                space.add_atom(atom).unwrap();
            }
            start.elapsed()
        })
    });

    group.bench_function("duplicate_merge", |b| {
        b.iter_custom(|iters| {
            let space = AtomSpace::new();
            let atom = Atom::node_with_tv(
                AtomType::Concept,
                "repeat",
                TruthValue::simple(0.9, 0.8).unwrap(),
            )
            .unwrap();
            space.add_atom(atom.clone()).unwrap();

            let start = Instant::now();
            for _ in 0..iters {
                space.add_atom(atom.clone()).unwrap();
            }
            start.elapsed()
        })
    });

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("space_query");
    group.throughput(Throughput::Elements(1));

    group.bench_function("incoming_on_chained_graph", |b| {
        let (space, handles) = seeded_space(1024);
        let mut cursor = 0usize;
        b.iter(|| {
            cursor = (cursor + 1) % handles.len();
            space.get_incoming(&handles[cursor]).unwrap()
        })
    });

    group.bench_function("atoms_by_type", |b| {
        let (space, _handles) = seeded_space(1024);
        b.iter(|| space.get_atoms_by_type(&AtomType::Inheritance).unwrap())
    });

    group.finish();
}

fn bench_export(c: &mut Criterion) {
    c.bench_function("space_export/2047_atoms", |b| {
        let (space, _handles) = seeded_space(1024);
        b.iter(|| space.export_atoms().unwrap())
    });
}

criterion_group!(space_benches, bench_insert, bench_queries, bench_export);
criterion_main!(space_benches);
