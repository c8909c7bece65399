use criterion::{criterion_group, criterion_main};

mod benchmarks;
mod utils;

criterion_group!(matching, benchmarks::matching::benchmark);
criterion_group!(limits, benchmarks::limits::benchmark);
criterion_group!(signature, benchmarks::signature::benchmark);

criterion_main!(matching, limits, signature);
