//! Per-instance health and load signals consumed by the selector.
//!
//! The selector depends only on [`InstanceMetricsSource`]. Any backend that can
//! answer "how many calls are in flight" and "what fraction failed recently"
//! for an instance can drive the ranking.

use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{InstanceKey, ServiceInstance};

/// Point-in-time reading for one instance
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// Calls currently in flight to the instance
    pub concurrency: u64,

    /// Failure ratio over the source's trailing window, in `[0, 1]`
    pub recent_failure_rate: f64,
}

impl MetricSnapshot {
    /// "Assume healthy, unproven": used for unknown instances and whenever a
    /// lookup fails.
    pub const NEUTRAL: MetricSnapshot = MetricSnapshot {
        concurrency: 0,
        recent_failure_rate: 0.0,
    };

    /// Build a snapshot, clamping the failure rate into `[0, 1]`
    pub fn new(concurrency: u64, recent_failure_rate: f64) -> Self {
        let recent_failure_rate = if recent_failure_rate.is_nan() {
            0.0
        } else {
            recent_failure_rate.clamp(0.0, 1.0)
        };
        Self {
            concurrency,
            recent_failure_rate,
        }
    }
}

impl Default for MetricSnapshot {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Capability interface the selector ranks against
///
/// Implementations own all smoothing, windowing and staleness policy; values
/// are taken as-is. Both lookups should be cheap in-memory reads since they run
/// on the selection hot path, once per candidate per call.
pub trait InstanceMetricsSource: Send + Sync {
    /// Current number of in-flight calls to `instance`
    fn concurrency(&self, instance: &ServiceInstance) -> BalancerResult<u64>;

    /// Recent failure ratio for `instance`, in `[0, 1]`
    fn recent_failure_rate(&self, instance: &ServiceInstance) -> BalancerResult<f64>;

    /// Read both signals for `instance`
    ///
    /// If either lookup fails the whole snapshot falls back to
    /// [`MetricSnapshot::NEUTRAL`]; a metrics outage degrades ranking quality
    /// but never fails a selection.
    fn snapshot(&self, instance: &ServiceInstance) -> MetricSnapshot {
        let concurrency = self.concurrency(instance);
        let failure_rate = self.recent_failure_rate(instance);
        match (concurrency, failure_rate) {
            (Ok(concurrency), Ok(rate)) => MetricSnapshot::new(concurrency, rate),
            (Err(e), _) | (_, Err(e)) => {
                warn!(
                    instance = %instance.address(),
                    error = %e,
                    "Metrics lookup failed, ranking instance with neutral metrics"
                );
                MetricSnapshot::NEUTRAL
            }
        }
    }
}

/// Metrics source that knows nothing: every instance is neutral
///
/// With this source the selector degenerates to per-request round robin.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralMetrics;

impl InstanceMetricsSource for NeutralMetrics {
    fn concurrency(&self, _instance: &ServiceInstance) -> BalancerResult<u64> {
        Ok(0)
    }

    fn recent_failure_rate(&self, _instance: &ServiceInstance) -> BalancerResult<f64> {
        Ok(0.0)
    }
}

/// Metrics source backed by a table of caller-provided snapshots
///
/// Useful for tests and for pinning a static preference order. Instances that
/// were never set read as neutral; instances marked unavailable fail their
/// lookups.
#[derive(Debug, Default)]
pub struct FixedMetrics {
    snapshots: DashMap<InstanceKey, MetricSnapshot>,
    unavailable: DashMap<InstanceKey, String>,
}

impl FixedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot reported for `instance`
    pub fn set(&self, instance: &ServiceInstance, concurrency: u64, recent_failure_rate: f64) {
        let key = instance.key();
        self.unavailable.remove(&key);
        self.snapshots
            .insert(key, MetricSnapshot::new(concurrency, recent_failure_rate));
    }

    /// Make lookups for `instance` fail with `reason`
    pub fn mark_unavailable(&self, instance: &ServiceInstance, reason: impl Into<String>) {
        self.unavailable.insert(instance.key(), reason.into());
    }

    /// Forget everything known about `instance`
    pub fn clear(&self, instance: &ServiceInstance) {
        let key = instance.key();
        self.snapshots.remove(&key);
        self.unavailable.remove(&key);
    }

    fn lookup(&self, instance: &ServiceInstance) -> BalancerResult<MetricSnapshot> {
        let key = instance.key();
        if let Some(reason) = self.unavailable.get(&key) {
            return Err(BalancerError::metrics_unavailable(
                instance.address(),
                reason.value().clone(),
            ));
        }
        Ok(self
            .snapshots
            .get(&key)
            .map(|entry| *entry.value())
            .unwrap_or(MetricSnapshot::NEUTRAL))
    }
}

impl InstanceMetricsSource for FixedMetrics {
    fn concurrency(&self, instance: &ServiceInstance) -> BalancerResult<u64> {
        self.lookup(instance).map(|snapshot| snapshot.concurrency)
    }

    fn recent_failure_rate(&self, instance: &ServiceInstance) -> BalancerResult<f64> {
        self.lookup(instance).map(|snapshot| snapshot.recent_failure_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_clamps_failure_rate() {
        assert_eq!(MetricSnapshot::new(1, 1.5).recent_failure_rate, 1.0);
        assert_eq!(MetricSnapshot::new(1, -0.2).recent_failure_rate, 0.0);
        assert_eq!(MetricSnapshot::new(1, f64::NAN).recent_failure_rate, 0.0);
    }

    #[test]
    fn test_fixed_metrics_unknown_instance_is_neutral() {
        let metrics = FixedMetrics::new();
        let instance = ServiceInstance::new("svc", "10.0.0.1", 80);
        assert_eq!(metrics.snapshot(&instance), MetricSnapshot::NEUTRAL);
    }

    #[test]
    fn test_failed_lookup_degrades_to_neutral() {
        let metrics = FixedMetrics::new();
        let instance = ServiceInstance::new("svc", "10.0.0.1", 80);
        metrics.set(&instance, 7, 0.9);
        metrics.mark_unavailable(&instance, "collector restarting");

        assert!(metrics.concurrency(&instance).is_err());
        assert_eq!(metrics.snapshot(&instance), MetricSnapshot::NEUTRAL);

        metrics.set(&instance, 7, 0.9);
        assert_eq!(metrics.snapshot(&instance), MetricSnapshot::new(7, 0.9));
    }
}
