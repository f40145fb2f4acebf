use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use mesh_topology::algs::communicator::NoComm;
use mesh_topology::algs::create_topology::create_topology;
use mesh_topology::topology::adjacency::AdjacencyList;
use mesh_topology::topology::cell_type::CellType;
use mesh_topology::topology::topology::{Intermediates, Topology};

/// Structured `n x n` grid of triangles, two per square.
fn unit_square(n: i64) -> Topology<NoComm> {
    let v = |i: i64, j: i64| j * (n + 1) + i;
    let mut cells = Vec::new();
    for j in 0..n {
        for i in 0..n {
            cells.push(vec![v(i, j), v(i + 1, j), v(i, j + 1)]);
            cells.push(vec![v(i + 1, j), v(i + 1, j + 1), v(i, j + 1)]);
        }
    }
    let original: Vec<i64> = (0..cells.len() as i64).collect();
    let cells = AdjacencyList::from_nested(cells);
    create_topology(&NoComm, &cells, &original, &[], CellType::Triangle).expect("grid topology")
}

fn bench_topology_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology_cache");

    for &n in &[16i64, 64i64] {
        group.bench_with_input(BenchmarkId::new("create_topology", n), &n, |b, &n| {
            b.iter(|| black_box(unit_square(n)));
        });

        group.bench_with_input(BenchmarkId::new("edges_cold_keep", n), &n, |b, &n| {
            b.iter_batched(
                || unit_square(n),
                |topo| black_box(topo.connectivity(2, 1).expect("edges")),
                criterion::BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("edges_cold_discard", n), &n, |b, &n| {
            b.iter_batched(
                || unit_square(n),
                |topo| {
                    black_box(
                        topo.connectivity_with(2, 1, Intermediates::Discard)
                            .expect("edges"),
                    )
                },
                criterion::BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("edges_warm", n), &n, |b, &n| {
            let topo = unit_square(n);
            topo.connectivity(2, 1).expect("edges");
            b.iter(|| black_box(topo.connectivity(2, 1).expect("edges")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_topology_cache);
criterion_main!(benches);
