//! # Selection Benchmarks
//!
//! Measures the synchronous selection hot path: metric reads, ranking and the
//! rotation fetch-and-increment, across pool sizes and key cardinalities.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use adaptive_balancer::core::types::{RequestKey, ServiceInstance};
use adaptive_balancer::load_balancing::{
    AdaptiveBalancer, InstanceMetrics, InstanceSelector, RotationConfig, RotationStore,
};

fn create_pool(size: usize) -> Vec<ServiceInstance> {
    (0..size)
        .map(|i| ServiceInstance::new("bench-service", format!("10.0.{}.{}", i / 250, i % 250), 8080))
        .collect()
}

/// Metrics with some in-flight load and failures so the ranking has work to do
fn seeded_metrics(pool: &[ServiceInstance]) -> Arc<InstanceMetrics> {
    let metrics = Arc::new(InstanceMetrics::with_defaults());
    for (i, instance) in pool.iter().enumerate() {
        for call in 0..(i % 5) {
            metrics.start_call(instance).finish(call % 2 == 0);
        }
        for _ in 0..(i % 3) {
            metrics.record_call_started(instance);
        }
    }
    metrics
}

fn benchmark_select_by_pool_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_by_pool_size");

    for &size in &[2usize, 8, 32, 128] {
        let pool = create_pool(size);
        let balancer = AdaptiveBalancer::new(
            seeded_metrics(&pool),
            Arc::new(RotationStore::with_defaults()),
        );
        let key = RequestKey::new("bench-trace");

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &pool, |b, pool| {
            b.iter(|| black_box(balancer.select(&key, pool).unwrap()));
        });
    }
    group.finish();
}

fn benchmark_fresh_keys(c: &mut Criterion) {
    let pool = create_pool(8);
    let balancer = AdaptiveBalancer::new(
        seeded_metrics(&pool),
        Arc::new(RotationStore::new(RotationConfig {
            max_entries: 50_000,
            ..RotationConfig::default()
        })),
    );
    let mut counter = 0u64;

    c.bench_function("select_fresh_key", |b| {
        b.iter(|| {
            counter += 1;
            let key = RequestKey::from(counter);
            black_box(balancer.select(&key, &pool).unwrap());
        });
    });
}

fn benchmark_rotation_increment(c: &mut Criterion) {
    let store = RotationStore::with_defaults();
    let key = RequestKey::new("bench-trace");
    let handle = store.get_or_create(&key);

    c.bench_function("rotation_increment_and_get", |b| {
        b.iter(|| black_box(store.increment_and_get(&handle)));
    });
    c.bench_function("rotation_next_position", |b| {
        b.iter(|| black_box(store.next_position(&key)));
    });
}

criterion_group!(
    benches,
    benchmark_select_by_pool_size,
    benchmark_fresh_keys,
    benchmark_rotation_increment
);
criterion_main!(benches);
