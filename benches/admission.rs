//! Admission check benchmarks.

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gatewarden::{Dimension, EngineConfig, LimitSet, RequestContext, RequestTracker};

fn bench_single_dimension_check(c: &mut Criterion) {
    let config = EngineConfig::default()
        .with_limits(Dimension::Address, LimitSet::new(u64::MAX / 2, u64::MAX / 2));
    let tracker = RequestTracker::with_config(config).unwrap();
    let now = Utc.timestamp_opt(1_704_110_400, 0).single().unwrap();

    c.bench_function("check_address_only", |b| {
        b.iter(|| {
            let ctx = RequestContext::new().with_address("203.0.113.1").at(now);
            black_box(tracker.check(&ctx))
        });
    });
}

fn bench_full_pipeline_check(c: &mut Criterion) {
    let config = EngineConfig::default()
        .with_limits(Dimension::Address, LimitSet::new(u64::MAX / 2, u64::MAX / 2))
        .with_limits(Dimension::Identity, LimitSet::new(u64::MAX / 2, u64::MAX / 2))
        .with_limits(Dimension::Operation, LimitSet::new(u64::MAX / 2, u64::MAX / 2));
    let tracker = RequestTracker::with_config(config).unwrap();
    tracker.assign_tier("user-1", "gold").unwrap();
    let now = Utc.timestamp_opt(1_704_110_400, 0).single().unwrap();

    c.bench_function("check_all_dimensions", |b| {
        b.iter(|| {
            let ctx = RequestContext::new()
                .with_address("203.0.113.1")
                .with_identity("user-1")
                .with_operation("search")
                .at(now);
            black_box(tracker.check(&ctx))
        });
    });
}

fn bench_check_across_many_keys(c: &mut Criterion) {
    let config = EngineConfig::default()
        .with_limits(Dimension::Address, LimitSet::new(u64::MAX / 2, u64::MAX / 2));
    let tracker = RequestTracker::with_config(config).unwrap();
    let now = Utc.timestamp_opt(1_704_110_400, 0).single().unwrap();
    let addresses: Vec<String> = (0..1024).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();

    c.bench_function("check_1024_addresses", |b| {
        let mut i = 0;
        b.iter(|| {
            let ctx = RequestContext::new()
                .with_address(&addresses[i % addresses.len()])
                .at(now);
            i += 1;
            black_box(tracker.check(&ctx))
        });
    });
}

criterion_group!(
    benches,
    bench_single_dimension_check,
    bench_full_pipeline_check,
    bench_check_across_many_keys
);
criterion_main!(benches);
