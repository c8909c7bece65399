use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion};
use glideinwms::frontend::limits::apply_group_cap;

fn bench_apply_group_cap(c: &mut Criterion) {
    for entry_count in [10, 1_000, 100_000] {
        c.bench_with_input(
            BenchmarkId::new("apply group cap", entry_count),
            &entry_count,
            |b, &entry_count| {
                b.iter_batched_ref(
                    || {
                        (0..entry_count as u64)
                            .map(|index| 1 + index % 97)
                            .collect::<Vec<_>>()
                    },
                    |targets| {
                        let cap = targets.len() as u64 * 10;
                        apply_group_cap(black_box(targets), cap);
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

pub fn benchmark(c: &mut Criterion) {
    bench_apply_group_cap(c);
}
