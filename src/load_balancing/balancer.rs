//! # Adaptive Load Balancer
//!
//! Selects one instance per attempt from the candidate list supplied by
//! discovery, ranking candidates by live health and load:
//!
//! 1. **Recent failure rate**, ascending: the healthiest instance first
//! 2. **Concurrency**, ascending: among equally healthy instances, the least loaded
//! 3. **Discovery order**: instances that tie on both keep their input order
//!
//! The ranked list is then indexed with the rotation position of the logical
//! request (`position mod len`). The first attempt of a request lands on the
//! best instance; a retry of the same request lands on the next-best, ranked
//! again from fresh metrics.
//!
//! ## Rust Concepts Explained
//!
//! - Selection returns `&'a ServiceInstance` borrowed from the caller's slice, so
//!   no instance is cloned on the hot path
//! - `Arc<dyn InstanceMetricsSource>` lets any metrics backend drive the ranking
//! - `DashMap` keeps per-instance statistics without a global lock
//!
//! ## Usage Example
//!
//! ```rust
//! use adaptive_balancer::load_balancing::{
//!     AdaptiveBalancer, InstanceMetrics, InstanceSelector, RotationStore,
//! };
//! use adaptive_balancer::core::types::{RequestKey, ServiceInstance};
//! use std::sync::Arc;
//!
//! let balancer = AdaptiveBalancer::new(
//!     Arc::new(InstanceMetrics::with_defaults()),
//!     Arc::new(RotationStore::with_defaults()),
//! );
//! let instances = vec![
//!     ServiceInstance::new("orders", "10.0.0.1", 8080),
//!     ServiceInstance::new("orders", "10.0.0.2", 8080),
//! ];
//! let key = RequestKey::generate();
//! let first = balancer.select(&key, &instances).unwrap();
//! let retry = balancer.select(&key, &instances).unwrap();
//! assert_ne!(first, retry);
//! ```

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{InstanceKey, RequestKey, ServiceInstance};
use crate::load_balancing::metrics_source::{InstanceMetricsSource, MetricSnapshot};
use crate::load_balancing::rotation::RotationStore;

/// Core trait for instance selection strategies
///
/// Selection is synchronous: it performs no I/O and never suspends.
pub trait InstanceSelector: Send + Sync {
    /// Pick the instance for this attempt of the logical request `key`
    ///
    /// # Returns
    /// * `Ok(instance)` - borrowed from `candidates`
    /// * `Err(BalancerError::EmptyPool)` - `candidates` was empty
    fn select<'a>(
        &self,
        key: &RequestKey,
        candidates: &'a [ServiceInstance],
    ) -> BalancerResult<&'a ServiceInstance>;

    /// Get the algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;
}

/// One candidate with the metrics it was ranked by
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate<'a> {
    pub instance: &'a ServiceInstance,
    /// Index in the candidate slice as supplied by discovery
    pub input_index: usize,
    pub metrics: MetricSnapshot,
}

/// Result of a selection, with the rotation details that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<'a> {
    pub instance: &'a ServiceInstance,
    /// Rotation position observed for the request key (pre-increment value)
    pub position: u64,
    /// Index of the instance in the ranked list
    pub rank: usize,
    pub metrics: MetricSnapshot,
}

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: String,
    pub total_selections: u64,
    pub empty_pool_rejections: u64,
    pub tracked_requests: usize,
    /// Keyed by `host:port`
    pub instance_stats: HashMap<String, InstanceStats>,
}

/// Per-instance statistics
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub selections: u64,
    pub last_selected: Option<chrono::DateTime<chrono::Utc>>,
}

/// Failure-rate and concurrency aware balancer with per-request rotation
pub struct AdaptiveBalancer {
    metrics: Arc<dyn InstanceMetricsSource>,
    rotation: Arc<RotationStore>,
    stats: DashMap<InstanceKey, InstanceStats>,
    total_selections: AtomicU64,
    empty_pool_rejections: AtomicU64,
}

impl AdaptiveBalancer {
    /// Create a balancer over a metrics source and a rotation store
    ///
    /// The caller keeps ownership of the store's lifecycle (sweeping, sharing it
    /// between balancers, dropping it).
    pub fn new(metrics: Arc<dyn InstanceMetricsSource>, rotation: Arc<RotationStore>) -> Self {
        Self {
            metrics,
            rotation,
            stats: DashMap::new(),
            total_selections: AtomicU64::new(0),
            empty_pool_rejections: AtomicU64::new(0),
        }
    }

    pub fn rotation(&self) -> &Arc<RotationStore> {
        &self.rotation
    }

    pub fn metrics_source(&self) -> &Arc<dyn InstanceMetricsSource> {
        &self.metrics
    }

    /// Rank `candidates` best-first from a fresh metrics read
    ///
    /// The sort is stable and the input index is the last key, so instances
    /// with equal scores never leave discovery order.
    pub fn rank<'a>(&self, candidates: &'a [ServiceInstance]) -> Vec<RankedCandidate<'a>> {
        let mut ranked: Vec<RankedCandidate<'a>> = candidates
            .iter()
            .enumerate()
            .map(|(input_index, instance)| RankedCandidate {
                instance,
                input_index,
                metrics: self.metrics.snapshot(instance),
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.metrics
                .recent_failure_rate
                .total_cmp(&b.metrics.recent_failure_rate)
                .then(a.metrics.concurrency.cmp(&b.metrics.concurrency))
                .then(a.input_index.cmp(&b.input_index))
        });
        ranked
    }

    /// Select an instance and report the rotation details
    ///
    /// An empty pool is rejected before the rotation store is touched.
    pub fn select_with_position<'a>(
        &self,
        key: &RequestKey,
        candidates: &'a [ServiceInstance],
    ) -> BalancerResult<Selection<'a>> {
        if candidates.is_empty() {
            self.empty_pool_rejections.fetch_add(1, Ordering::Relaxed);
            counter!("adaptive_balancer_empty_pool_total").increment(1);
            warn!(request_key = %key, "Selection requested with an empty candidate pool");
            return Err(BalancerError::EmptyPool);
        }

        let mut ranked = self.rank(candidates);
        let position = self.rotation.next_position(key);
        let rank = (position % ranked.len() as u64) as usize;
        let chosen = ranked.swap_remove(rank);

        self.total_selections.fetch_add(1, Ordering::Relaxed);
        self.update_stats(chosen.instance.key());
        counter!("adaptive_balancer_selections_total").increment(1);

        debug!(
            request_key = %key,
            instance_id = %chosen.instance.id,
            instance_address = %chosen.instance.address(),
            position,
            rank,
            candidates = candidates.len(),
            failure_rate = chosen.metrics.recent_failure_rate,
            concurrency = chosen.metrics.concurrency,
            algorithm = self.algorithm_name(),
            "Selected instance"
        );

        Ok(Selection {
            instance: chosen.instance,
            position,
            rank,
            metrics: chosen.metrics,
        })
    }

    /// Get current statistics for this balancer
    pub fn stats(&self) -> LoadBalancerStats {
        let instance_stats = self
            .stats
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect();

        LoadBalancerStats {
            algorithm: self.algorithm_name().to_string(),
            total_selections: self.total_selections.load(Ordering::Relaxed),
            empty_pool_rejections: self.empty_pool_rejections.load(Ordering::Relaxed),
            tracked_requests: self.rotation.len(),
            instance_stats,
        }
    }

    /// Reset statistics; rotation state is left untouched
    pub fn reset_stats(&self) {
        self.stats.clear();
        self.total_selections.store(0, Ordering::Relaxed);
        self.empty_pool_rejections.store(0, Ordering::Relaxed);
    }

    /// Drop the statistics of an endpoint that has left discovery
    pub fn forget_instance(&self, instance: &ServiceInstance) -> bool {
        self.stats.remove(&instance.key()).is_some()
    }

    fn update_stats(&self, key: InstanceKey) {
        let mut stats = self
            .stats
            .entry(key)
            .or_insert_with(|| InstanceStats {
                selections: 0,
                last_selected: None,
            });
        stats.selections += 1;
        stats.last_selected = Some(chrono::Utc::now());
    }
}

impl InstanceSelector for AdaptiveBalancer {
    fn select<'a>(
        &self,
        key: &RequestKey,
        candidates: &'a [ServiceInstance],
    ) -> BalancerResult<&'a ServiceInstance> {
        self.select_with_position(key, candidates)
            .map(|selection| selection.instance)
    }

    fn algorithm_name(&self) -> &'static str {
        "adaptive_rotation"
    }
}
