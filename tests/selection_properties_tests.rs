//! # Selection Property Tests
//!
//! Exercises the selector through its public API: ranking order, rotation
//! per request key, the empty-pool contract, metrics degradation, and
//! position uniqueness under concurrent callers.

use adaptive_balancer::core::error::BalancerError;
use adaptive_balancer::core::types::{RequestKey, ServiceInstance};
use adaptive_balancer::load_balancing::{
    AdaptiveBalancer, FixedMetrics, InstanceSelector, NeutralMetrics, RotationStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

/// Four instances A, B, C, D in discovery order
fn candidates() -> Vec<ServiceInstance> {
    ["a", "b", "c", "d"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            ServiceInstance::new("orders", format!("10.0.0.{}", i + 1), 8080).with_id(*name)
        })
        .collect()
}

fn balancer_with(metrics: Arc<FixedMetrics>) -> AdaptiveBalancer {
    AdaptiveBalancer::new(metrics, Arc::new(RotationStore::with_defaults()))
}

fn set_all(metrics: &FixedMetrics, instances: &[ServiceInstance], rows: &[(u64, f64)]) {
    for (instance, (concurrency, failure_rate)) in instances.iter().zip(rows) {
        metrics.set(instance, *concurrency, *failure_rate);
    }
}

fn ids<'a>(selected: impl IntoIterator<Item = &'a ServiceInstance>) -> Vec<String> {
    selected.into_iter().map(|i| i.id.clone()).collect()
}

#[test]
fn test_failure_rate_dominates() {
    let instances = candidates();
    let metrics = Arc::new(FixedMetrics::new());
    set_all(&metrics, &instances, &[(1, 0.1), (2, 0.1), (1, 0.2), (1, 0.3)]);
    let balancer = balancer_with(metrics);
    let key = RequestKey::new("trace-1");

    let first = balancer.select(&key, &instances).unwrap();
    let second = balancer.select(&key, &instances).unwrap();
    assert_eq!(first.id, "a");
    assert_eq!(second.id, "b");
}

#[test]
fn test_concurrency_breaks_failure_rate_ties() {
    let instances = candidates();
    let metrics = Arc::new(FixedMetrics::new());
    let balancer = balancer_with(metrics.clone());
    let key = RequestKey::new("trace-2");

    for _ in 0..4 {
        balancer.select(&key, &instances).unwrap();
    }
    assert_eq!(balancer.rotation().position(&key), Some(4));

    set_all(&metrics, &instances, &[(2, 1.0), (1, 1.0), (2, 1.0), (2, 1.0)]);
    assert_eq!(balancer.select(&key, &instances).unwrap().id, "b");
}

#[test]
fn test_ranking_is_deterministic_across_keys() {
    let instances = candidates();
    let metrics = Arc::new(FixedMetrics::new());
    set_all(&metrics, &instances, &[(3, 0.5), (0, 0.2), (9, 0.0), (1, 0.2)]);
    let balancer = balancer_with(metrics);

    let first = balancer.select(&RequestKey::new("k1"), &instances).unwrap();
    let second = balancer.select(&RequestKey::new("k2"), &instances).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.id, "c");
}

#[test]
fn test_strict_rotation_through_ranking() {
    let instances = candidates();
    let metrics = Arc::new(FixedMetrics::new());
    // Ranked order is D, C, B, A
    set_all(&metrics, &instances, &[(0, 0.4), (0, 0.3), (0, 0.2), (0, 0.1)]);
    let balancer = balancer_with(metrics);
    let key = RequestKey::new("trace-3");

    let picks: Vec<&ServiceInstance> = (0..8)
        .map(|_| balancer.select(&key, &instances).unwrap())
        .collect();
    assert_eq!(ids(picks), vec!["d", "c", "b", "a", "d", "c", "b", "a"]);
}

#[test]
fn test_equal_metrics_fall_back_to_round_robin() {
    let instances = candidates();
    let balancer = AdaptiveBalancer::new(
        Arc::new(NeutralMetrics),
        Arc::new(RotationStore::with_defaults()),
    );
    let key = RequestKey::new("trace-4");

    let picks: Vec<&ServiceInstance> = (0..instances.len())
        .map(|_| balancer.select(&key, &instances).unwrap())
        .collect();
    assert_eq!(ids(picks), vec!["a", "b", "c", "d"]);
}

#[test]
fn test_single_candidate_always_selected() {
    let instances = vec![ServiceInstance::new("orders", "10.0.0.1", 8080)];
    let balancer = balancer_with(Arc::new(FixedMetrics::new()));
    let key = RequestKey::new("trace-5");

    for _ in 0..3 {
        assert_eq!(balancer.select(&key, &instances).unwrap(), &instances[0]);
    }
    assert_eq!(balancer.rotation().position(&key), Some(3));
}

#[test]
fn test_empty_pool_leaves_rotation_untouched() {
    let balancer = balancer_with(Arc::new(FixedMetrics::new()));
    let key = RequestKey::new("trace-6");

    let result = balancer.select(&key, &[]);
    assert!(matches!(result, Err(BalancerError::EmptyPool)));
    assert!(balancer.rotation().is_empty());
    assert_eq!(balancer.rotation().position(&key), None);
    assert_eq!(balancer.stats().empty_pool_rejections, 1);

    // An existing key is not advanced either
    let instances = candidates();
    balancer.select(&key, &instances).unwrap();
    assert!(balancer.select(&key, &[]).is_err());
    assert_eq!(balancer.rotation().position(&key), Some(1));
}

#[test]
fn test_metrics_failure_degrades_to_neutral() {
    let instances = candidates();
    let metrics = Arc::new(FixedMetrics::new());
    set_all(&metrics, &instances, &[(5, 0.9), (1, 0.1), (1, 0.1), (1, 0.1)]);
    metrics.mark_unavailable(&instances[0], "collector offline");
    let balancer = balancer_with(metrics);

    // A reads as zero concurrency and zero failures, so it ranks first
    let selected = balancer.select(&RequestKey::new("trace-7"), &instances).unwrap();
    assert_eq!(selected.id, "a");
}

#[test]
fn test_concurrent_selection_yields_unique_positions() {
    const THREADS: usize = 16;
    const CALLS_PER_THREAD: usize = 250;

    let instances = Arc::new(candidates());
    let balancer = Arc::new(AdaptiveBalancer::new(
        Arc::new(NeutralMetrics),
        Arc::new(RotationStore::with_defaults()),
    ));
    let key = RequestKey::new("shared-trace");

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let balancer = Arc::clone(&balancer);
            let instances = Arc::clone(&instances);
            let key = key.clone();
            thread::spawn(move || {
                (0..CALLS_PER_THREAD)
                    .map(|_| {
                        balancer
                            .select_with_position(&key, &instances)
                            .unwrap()
                            .position
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut positions: Vec<u64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    positions.sort_unstable();

    let total = (THREADS * CALLS_PER_THREAD) as u64;
    assert_eq!(positions, (0..total).collect::<Vec<u64>>());
    assert_eq!(balancer.rotation().position(&key), Some(total));
}

#[test]
fn test_distinct_keys_rotate_independently() {
    let instances = candidates();
    let balancer = AdaptiveBalancer::new(
        Arc::new(NeutralMetrics),
        Arc::new(RotationStore::with_defaults()),
    );

    let mut seen = HashSet::new();
    for i in 0..4 {
        let key = RequestKey::from(format!("request-{}", i));
        seen.insert(balancer.select(&key, &instances).unwrap().id.clone());
    }
    // Every fresh key starts at position 0
    assert_eq!(seen.len(), 1);
    assert!(seen.contains("a"));
    assert_eq!(balancer.rotation().len(), 4);
}
