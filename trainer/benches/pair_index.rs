use cinet_trainer::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn responses(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 7919) % 1009) as f32 / 100.0).collect()
}

/// Pair index construction at typical cell-line counts.
fn bench_build_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_concordant_pairs");
    for n in [100usize, 500, 1000] {
        let responses = responses(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &responses, |b, r| {
            b.iter(|| build_concordant_pairs(black_box(r), 0.0, 256))
        });
    }
    group.finish();
}

/// Dataset construction: subset, normalise and pair.
fn bench_paired_dataset(c: &mut Criterion) {
    let n = 500;
    let width = 200;
    let ids = (0..n).map(|i| format!("cl{i}")).collect();
    let rows = (0..n)
        .map(|i| (0..width).map(|j| ((i * 31 + j * 17) % 97) as f32).collect())
        .collect();
    let table = SampleTable::new(ids, rows, responses(n)).expect("Failed to build table");

    c.bench_function("paired_dataset_train_500x200", |b| {
        b.iter(|| PairedDataset::new(black_box(&table), DatasetMode::Train, 0.1, 256, None))
    });
}

criterion_group!(benches, bench_build_pairs, bench_paired_dataset);
criterion_main!(benches);
