//! # In-Memory Instance Metrics
//!
//! Collects the two signals the selector ranks by, per `host:port`:
//!
//! - **calling**: calls currently in flight, maintained by [`InFlightCall`] guards
//! - **recent failure rate**: failed / total outcomes within a trailing window
//!
//! Outcome samples live in a bounded ring per instance and are pruned lazily
//! whenever the instance is read or written, so an idle instance's failure
//! rate decays back to zero once its samples age out of the window.

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{InstanceKey, ServiceInstance};
use crate::load_balancing::metrics_source::InstanceMetricsSource;

/// Configuration for the in-memory collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceMetricsConfig {
    /// Trailing window for the failure rate
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,

    /// Upper bound on outcome samples kept per instance
    pub max_samples_per_instance: usize,
}

impl Default for InstanceMetricsConfig {
    fn default() -> Self {
        Self {
            failure_window: Duration::from_secs(60),
            max_samples_per_instance: 1024,
        }
    }
}

impl InstanceMetricsConfig {
    pub fn validate(&self) -> BalancerResult<()> {
        if self.failure_window.is_zero() {
            return Err(BalancerError::config("metrics.failure_window must be greater than zero"));
        }
        if self.max_samples_per_instance == 0 {
            return Err(BalancerError::config(
                "metrics.max_samples_per_instance must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InstanceCounters {
    calling: AtomicU64,
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
}

impl InstanceCounters {
    fn decrement_calling(&self) -> u64 {
        let previous = self
            .calling
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Per-instance call accounting
pub struct InstanceMetrics {
    config: InstanceMetricsConfig,
    instances: DashMap<InstanceKey, Arc<InstanceCounters>>,
}

impl InstanceMetrics {
    pub fn new(config: InstanceMetricsConfig) -> Self {
        Self {
            config,
            instances: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(InstanceMetricsConfig::default())
    }

    pub fn config(&self) -> &InstanceMetricsConfig {
        &self.config
    }

    /// Mark a call to `instance` as started
    ///
    /// The returned guard must be finished with the call's outcome. Dropping it
    /// unfinished (e.g. the calling future was cancelled) releases the
    /// concurrency slot without recording an outcome.
    pub fn start_call(&self, instance: &ServiceInstance) -> InFlightCall<'_> {
        let key = instance.key();
        let counters = self.begin(&key);
        InFlightCall {
            metrics: self,
            key,
            counters,
            finished: false,
        }
    }

    /// Unguarded form of [`start_call`](Self::start_call)
    ///
    /// Every call must be paired with exactly one
    /// [`record_call_finished`](Self::record_call_finished).
    pub fn record_call_started(&self, instance: &ServiceInstance) {
        self.begin(&instance.key());
    }

    /// Release a slot taken by [`record_call_started`](Self::record_call_started)
    pub fn record_call_finished(&self, instance: &ServiceInstance, success: bool) {
        let key = instance.key();
        let counters = self.counters(&key);
        self.complete(&key, &counters, success);
    }

    /// Calls currently in flight to `instance`
    pub fn calling(&self, instance: &ServiceInstance) -> u64 {
        self.instances
            .get(&instance.key())
            .map(|entry| entry.value().calling.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Failure ratio within the trailing window; 0.0 without samples
    pub fn failure_rate(&self, instance: &ServiceInstance) -> f64 {
        let Some(counters) = self
            .instances
            .get(&instance.key())
            .map(|entry| Arc::clone(entry.value()))
        else {
            return 0.0;
        };

        let mut outcomes = counters.outcomes.lock();
        self.prune(&mut outcomes, Instant::now());
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|(_, success)| !success).count();
        failures as f64 / outcomes.len() as f64
    }

    /// Drop all state for `instance`
    pub fn forget(&self, instance: &ServiceInstance) {
        self.instances.remove(&instance.key());
    }

    /// Number of instances with recorded state
    pub fn tracked_instances(&self) -> usize {
        self.instances.len()
    }

    fn counters(&self, key: &InstanceKey) -> Arc<InstanceCounters> {
        if let Some(counters) = self.instances.get(key).map(|entry| Arc::clone(entry.value())) {
            return counters;
        }
        Arc::clone(self.instances.entry(key.clone()).or_default().value())
    }

    fn begin(&self, key: &InstanceKey) -> Arc<InstanceCounters> {
        let counters = self.counters(key);
        let calling = counters.calling.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!("adaptive_balancer_instance_in_flight", "instance" => key.to_string())
            .set(calling as f64);
        counters
    }

    fn complete(&self, key: &InstanceKey, counters: &InstanceCounters, success: bool) {
        let calling = counters.decrement_calling();
        gauge!("adaptive_balancer_instance_in_flight", "instance" => key.to_string())
            .set(calling as f64);
        if !success {
            counter!("adaptive_balancer_instance_failures_total", "instance" => key.to_string())
                .increment(1);
        }

        let now = Instant::now();
        let mut outcomes = counters.outcomes.lock();
        self.prune(&mut outcomes, now);
        if outcomes.len() >= self.config.max_samples_per_instance {
            outcomes.pop_front();
        }
        outcomes.push_back((now, success));
    }

    fn prune(&self, outcomes: &mut VecDeque<(Instant, bool)>, now: Instant) {
        while let Some(&(at, _)) = outcomes.front() {
            if now.duration_since(at) < self.config.failure_window {
                break;
            }
            outcomes.pop_front();
        }
    }
}

impl Default for InstanceMetrics {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl InstanceMetricsSource for InstanceMetrics {
    fn concurrency(&self, instance: &ServiceInstance) -> BalancerResult<u64> {
        Ok(self.calling(instance))
    }

    fn recent_failure_rate(&self, instance: &ServiceInstance) -> BalancerResult<f64> {
        Ok(self.failure_rate(instance))
    }
}

/// Guard for one in-flight call
#[must_use = "finish the call with its outcome, or it is counted as abandoned"]
pub struct InFlightCall<'a> {
    metrics: &'a InstanceMetrics,
    key: InstanceKey,
    counters: Arc<InstanceCounters>,
    finished: bool,
}

impl InFlightCall<'_> {
    /// Record the outcome and release the concurrency slot
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        self.metrics.complete(&self.key, &self.counters, success);
    }
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let calling = self.counters.decrement_calling();
            gauge!("adaptive_balancer_instance_in_flight", "instance" => self.key.to_string())
                .set(calling as f64);
        }
    }
}
