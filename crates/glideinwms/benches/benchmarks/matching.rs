use std::hint::black_box;

use criterion::{BenchmarkId, Criterion};
use glideinwms::matching::{FanOut, match_jobs};

use crate::utils::{create_entries, create_jobs, site_policy};

fn bench_match_jobs(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let policy = site_policy();

    for job_count in [100, 10_000, 100_000] {
        for entry_count in [10, 200] {
            let jobs = create_jobs(job_count);
            let entries = create_entries(entry_count);
            c.bench_with_input(
                BenchmarkId::new(
                    "match jobs",
                    format!("jobs={job_count}, entries={entry_count}"),
                ),
                &(jobs, entries),
                |b, (jobs, entries)| {
                    b.iter(|| {
                        runtime
                            .block_on(match_jobs(
                                &policy,
                                black_box(jobs),
                                black_box(entries),
                                FanOut {
                                    threshold: usize::MAX,
                                    workers: 1,
                                },
                            ))
                            .unwrap()
                    });
                },
            );
        }
    }
}

fn bench_job_census(c: &mut Criterion) {
    for job_count in [1_000, 100_000] {
        c.bench_with_input(
            BenchmarkId::new("classify job queue", job_count),
            &job_count,
            |b, &job_count| {
                b.iter(|| create_jobs(black_box(job_count)));
            },
        );
    }
}

pub fn benchmark(c: &mut Criterion) {
    bench_match_jobs(c);
    bench_job_census(c);
}
