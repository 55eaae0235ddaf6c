//! Benchmarks for the engine's hot paths: whole temporal-memory ticks and
//! raw activity scans over the reverse index.
//!
//! Run with: `cargo bench --bench tm_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use veles::prelude::*;

/// Draws `count` distinct column indices.
fn random_columns(rng: &mut Random, num_columns: u32, count: usize) -> Vec<u32> {
    let mut columns = Vec::with_capacity(count);
    while columns.len() < count {
        let column = rng.get_uint32_range(0, num_columns);
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    columns.sort_unstable();
    columns
}

/// Benchmark full compute ticks on a memory that has already learned a
/// repeating sequence, so the workload mixes predicted and bursting columns.
fn bench_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("tm_compute");
    group.sample_size(50);

    for &(num_columns, sparsity) in &[(2048u32, 0.02f32), (2048, 0.05)] {
        let active = (num_columns as f32 * sparsity) as usize;
        let mut rng = Random::new(42);
        let patterns: Vec<Vec<u32>> = (0..10)
            .map(|_| random_columns(&mut rng, num_columns, active))
            .collect();

        let mut tm = TemporalMemory::new(TemporalMemoryParams {
            column_dimensions: vec![num_columns],
            cells_per_column: 32,
            activation_threshold: 13,
            min_threshold: 10,
            max_new_synapse_count: 20,
            ..Default::default()
        })
        .unwrap();

        // Pre-train so segments exist and predictions fire.
        for _ in 0..20 {
            for pattern in &patterns {
                tm.compute(pattern, true);
            }
        }

        group.throughput(Throughput::Elements(active as u64));
        group.bench_function(
            BenchmarkId::new(format!("cols_{num_columns}_sparsity_{sparsity}"), active),
            |b| {
                let mut step = 0;
                b.iter(|| {
                    tm.compute(&patterns[step % patterns.len()], true);
                    step += 1;
                    black_box(tm.active_cells().len())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the raw activity scan: per-segment overlap counts against a
/// sparse set of active presynaptic cells.
fn bench_compute_activity(c: &mut Criterion) {
    let mut group = c.benchmark_group("connections_compute_activity");
    group.sample_size(200);

    for &(num_cells, num_segments, synapses_per_segment) in
        &[(65_536u32, 4_096usize, 20usize), (65_536, 16_384, 40)]
    {
        let mut conn = Connections::new(ConnectionsParams {
            num_cells,
            max_segments_per_cell: 255,
            max_synapses_per_segment: 255,
        })
        .unwrap();

        let mut rng = Random::new(7);
        for _ in 0..num_segments {
            let segment = conn.create_segment(rng.get_uint32_range(0, num_cells));
            for _ in 0..synapses_per_segment {
                let presynaptic = rng.get_uint32_range(0, num_cells);
                let permanence = 0.1 + 0.8 * rng.get_real32();
                conn.create_synapse(segment, presynaptic, permanence);
            }
        }

        let active: Vec<u32> = (0..1310)
            .map(|_| rng.get_uint32_range(0, num_cells))
            .collect();

        group.throughput(Throughput::Elements(active.len() as u64));
        group.bench_function(
            BenchmarkId::new(
                format!("segments_{num_segments}_synapses_{synapses_per_segment}"),
                active.len(),
            ),
            |b| {
                let length = conn.segment_flat_list_length();
                let mut connected = vec![0u32; length];
                let mut potential = vec![0u32; length];
                b.iter(|| {
                    connected.iter_mut().for_each(|c| *c = 0);
                    potential.iter_mut().for_each(|c| *c = 0);
                    conn.compute_activity(&mut connected, &mut potential, &active, 0.5);
                    black_box(connected[0] + potential[0])
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_compute, bench_compute_activity);
criterion_main!(benches);
