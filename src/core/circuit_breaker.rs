//! Circuit Breaker Implementation
//!
//! Guards calls to a single `instance + operation` pair. Unlike a
//! consecutive-failure breaker, this one opens on the failure *rate* over a
//! count-based sliding window, and only once enough calls have been seen for
//! the rate to mean something.
//!
//! ## States:
//! - **Closed**: calls pass through, outcomes feed the sliding window
//! - **Open**: calls are rejected until `wait_duration_in_open_state` elapses
//! - **HalfOpen**: a fixed number of trial calls is admitted; their failure
//!   rate decides between closing and re-opening
//!
//! ## Key Rust Concepts:
//! - One `parking_lot::Mutex` guards the state and window together, so a
//!   transition and the outcome that caused it are never observed apart
//! - `AtomicU64` counters for lock-free metrics collection
//! - `DashMap` in the registry so concurrent `get_or_create` calls for the
//!   same name share one breaker
//! - [`CallPermit`] is an RAII guard: a permit dropped without an outcome
//!   (the call was cancelled) hands its half-open trial slot back

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::error::{BalancerError, BalancerResult};

/// Circuit breaker state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerState {
    /// Normal operation
    Closed,

    /// Rejecting calls since `opened_at`
    Open { opened_at: Instant },

    /// Trial phase: `admitted` calls let through so far, with their outcomes
    HalfOpen {
        admitted: u32,
        successes: u32,
        failures: u32,
    },
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open { .. } => "open",
            CircuitBreakerState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100] at which the circuit opens
    pub failure_rate_threshold: f64,

    /// Calls that must be recorded before the rate is evaluated
    pub minimum_number_of_calls: u32,

    /// Number of most recent outcomes kept in the window
    pub sliding_window_size: u32,

    /// How long to stay open before admitting trial calls
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open_state: Duration,

    /// Trial calls admitted while half-open
    pub permitted_calls_in_half_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            minimum_number_of_calls: 10,
            sliding_window_size: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> BalancerResult<()> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(BalancerError::config(
                "circuit_breaker.failure_rate_threshold must be in (0, 100]",
            ));
        }
        if self.sliding_window_size == 0 {
            return Err(BalancerError::config(
                "circuit_breaker.sliding_window_size must be at least 1",
            ));
        }
        if self.minimum_number_of_calls == 0
            || self.minimum_number_of_calls > self.sliding_window_size
        {
            return Err(BalancerError::config(
                "circuit_breaker.minimum_number_of_calls must be between 1 and sliding_window_size",
            ));
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err(BalancerError::config(
                "circuit_breaker.permitted_calls_in_half_open must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Metrics collected by the circuit breaker
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub rejected_requests: AtomicU64,
    /// Permits dropped without an outcome
    pub abandoned_requests: AtomicU64,
    pub circuit_opened_count: AtomicU64,
    pub circuit_closed_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            abandoned_requests: self.abandoned_requests.load(Ordering::Relaxed),
            circuit_opened_count: self.circuit_opened_count.load(Ordering::Relaxed),
            circuit_closed_count: self.circuit_closed_count.load(Ordering::Relaxed),
        }
    }

    /// Lifetime failure rate as a percentage
    pub fn failure_rate(&self) -> f64 {
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let succeeded = self.successful_requests.load(Ordering::Relaxed);
        let total = failed + succeeded;
        if total == 0 {
            return 0.0;
        }
        (failed as f64 / total as f64) * 100.0
    }
}

/// Immutable snapshot of circuit breaker metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub abandoned_requests: u64,
    pub circuit_opened_count: u64,
    pub circuit_closed_count: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    /// `true` marks a failure
    window: VecDeque<bool>,
    window_failures: u32,
    /// Bumped on every transition into half-open
    trial_epoch: u64,
}

impl BreakerInner {
    fn push(&mut self, failed: bool, capacity: usize) {
        if self.window.len() >= capacity {
            if let Some(true) = self.window.pop_front() {
                self.window_failures -= 1;
            }
        }
        self.window.push_back(failed);
        if failed {
            self.window_failures += 1;
        }
    }

    fn reset_window(&mut self) {
        self.window.clear();
        self.window_failures = 0;
    }
}

/// Failure-rate circuit breaker for one named call target
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<CircuitBreakerMetrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let capacity = config.sliding_window_size as usize;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                window: VecDeque::with_capacity(capacity),
                window_failures: 0,
                trial_epoch: 0,
            }),
            metrics: Arc::new(CircuitBreakerMetrics::default()),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Ask permission for one call
    ///
    /// Every `Ok` must be followed by exactly one `record_success` or
    /// `record_failure`. A rejection is `BalancerError::CircuitBreakerOpen`.
    /// Prefer [`try_acquire_permit`](Self::try_acquire_permit) when the call
    /// can be cancelled.
    pub fn try_acquire(&self) -> BalancerResult<()> {
        self.acquire().map(|_| ())
    }

    /// Ask permission for one call, returning a guard that records its outcome
    pub fn try_acquire_permit(&self) -> BalancerResult<CallPermit<'_>> {
        let epoch = self.acquire()?;
        Ok(CallPermit {
            breaker: self,
            epoch,
            finished: false,
        })
    }

    fn acquire(&self) -> BalancerResult<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let permitted = match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.wait_duration_in_open_state {
                    inner.state = CircuitBreakerState::HalfOpen {
                        admitted: 1,
                        successes: 0,
                        failures: 0,
                    };
                    inner.trial_epoch += 1;
                    info!(circuit_breaker = %self.name, "Circuit breaker half-open, admitting trial calls");
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen {
                ref mut admitted, ..
            } => {
                if *admitted < self.config.permitted_calls_in_half_open {
                    *admitted += 1;
                    true
                } else {
                    false
                }
            }
        };

        if permitted {
            self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
            Ok(inner.trial_epoch)
        } else {
            self.metrics.rejected_requests.fetch_add(1, Ordering::Relaxed);
            Err(BalancerError::CircuitBreakerOpen {
                name: self.name.clone(),
            })
        }
    }

    /// Hand back the trial slot of a permit dropped without an outcome
    ///
    /// Only applies while the half-open phase that admitted the call is still
    /// running; a closed circuit has no slots to return.
    fn abandon(&self, epoch: u64) {
        self.metrics.abandoned_requests.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.trial_epoch != epoch {
            return;
        }
        if let CircuitBreakerState::HalfOpen {
            ref mut admitted,
            successes,
            failures,
        } = inner.state
        {
            if *admitted > successes + failures {
                *admitted -= 1;
                debug!(circuit_breaker = %self.name, "Abandoned trial call released its slot");
            }
        }
    }

    pub fn record_success(&self) {
        self.metrics.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.record(false);
    }

    pub fn record_failure(&self) {
        self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.record(true);
    }

    fn record(&self, failed: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.push(failed, self.config.sliding_window_size as usize);
                let recorded = inner.window.len() as u32;
                if recorded >= self.config.minimum_number_of_calls {
                    let rate = inner.window_failures as f64 / recorded as f64 * 100.0;
                    if rate >= self.config.failure_rate_threshold {
                        warn!(
                            circuit_breaker = %self.name,
                            failure_rate = rate,
                            calls = recorded,
                            "Circuit breaker opened"
                        );
                        self.open(inner);
                    }
                }
            }
            // Late outcome of a call admitted before the circuit opened
            CircuitBreakerState::Open { .. } => {}
            CircuitBreakerState::HalfOpen {
                admitted,
                successes,
                failures,
            } => {
                let (successes, failures) = if failed {
                    (successes, failures + 1)
                } else {
                    (successes + 1, failures)
                };
                let completed = successes + failures;
                if completed >= self.config.permitted_calls_in_half_open {
                    let rate = failures as f64 / completed as f64 * 100.0;
                    if rate >= self.config.failure_rate_threshold {
                        warn!(circuit_breaker = %self.name, failure_rate = rate, "Trial calls failed, circuit breaker re-opened");
                        self.open(inner);
                    } else {
                        info!(circuit_breaker = %self.name, failure_rate = rate, "Circuit breaker closed");
                        self.close(inner);
                    }
                } else {
                    inner.state = CircuitBreakerState::HalfOpen {
                        admitted,
                        successes,
                        failures,
                    };
                }
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitBreakerState::Open {
            opened_at: Instant::now(),
        };
        inner.reset_window();
        self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
        counter!("adaptive_balancer_circuit_opened_total", "circuit_breaker" => self.name.clone())
            .increment(1);
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.state = CircuitBreakerState::Closed;
        inner.reset_window();
        self.metrics.circuit_closed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<CircuitBreakerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Manually open the circuit (admin override)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner);
    }

    /// Manually close the circuit (admin override)
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }
}

/// Admission to one call, obtained from [`CircuitBreaker::try_acquire_permit`]
#[must_use = "finish the permit with the call's outcome, or it is counted as abandoned"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    finished: bool,
}

impl CallPermit<'_> {
    /// Record the call's outcome
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.abandon(self.epoch);
        }
    }
}

/// Circuit breakers keyed by name
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    /// Get or create a circuit breaker for the given name
    ///
    /// `config` only applies when the breaker is created.
    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())));
        Arc::clone(breaker.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, breaker)| breaker)
    }

    /// Drop every breaker whose name starts with `prefix`, returning how many
    pub fn remove_prefixed(&self, prefix: &str) -> usize {
        let before = self.breakers.len();
        self.breakers.retain(|name, _| !name.starts_with(prefix));
        before.saturating_sub(self.breakers.len())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 50.0,
            minimum_number_of_calls: 4,
            sliding_window_size: 4,
            wait_duration_in_open_state: Duration::from_millis(20),
            permitted_calls_in_half_open: 2,
        }
    }

    fn call(cb: &CircuitBreaker, success: bool) {
        cb.try_acquire().unwrap();
        if success {
            cb.record_success();
        } else {
            cb.record_failure();
        }
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_waits_for_minimum_number_of_calls() {
        let cb = CircuitBreaker::new("test", small_config());
        for _ in 0..3 {
            call(&cb, false);
        }
        // 100% failures but only 3 of the 4 required calls
        assert_eq!(cb.state(), CircuitBreakerState::Closed);

        call(&cb, false);
        assert!(matches!(cb.state(), CircuitBreakerState::Open { .. }));
        assert!(matches!(
            cb.try_acquire(),
            Err(BalancerError::CircuitBreakerOpen { .. })
        ));
        assert_eq!(cb.metrics().snapshot().rejected_requests, 1);
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new("test", small_config());
        for success in [true, false, true, true, false, true, true] {
            call(&cb, success);
        }
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_window_slides() {
        let cb = CircuitBreaker::new("test", small_config());
        for success in [false, true, true, true] {
            call(&cb, success);
        }
        // Window is now [T, T, T, F] after the oldest failure slid out
        call(&cb, false);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        // [T, T, F, F] reaches 50%
        call(&cb, false);
        assert!(matches!(cb.state(), CircuitBreakerState::Open { .. }));
    }

    #[test]
    fn test_half_open_closes_after_successful_trials() {
        let cb = CircuitBreaker::new("test", small_config());
        cb.force_open();
        thread::sleep(Duration::from_millis(30));

        call(&cb, true);
        assert!(matches!(cb.state(), CircuitBreakerState::HalfOpen { .. }));
        call(&cb, true);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.metrics().snapshot().circuit_closed_count, 1);
    }

    #[test]
    fn test_half_open_limits_trial_calls() {
        let cb = CircuitBreaker::new("test", small_config());
        cb.force_open();
        thread::sleep(Duration::from_millis(30));

        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_reopens_on_failed_trials() {
        let cb = CircuitBreaker::new("test", small_config());
        cb.force_open();
        thread::sleep(Duration::from_millis(30));

        call(&cb, true);
        call(&cb, false);
        assert!(matches!(cb.state(), CircuitBreakerState::Open { .. }));
        assert_eq!(cb.metrics().snapshot().circuit_opened_count, 2);
    }

    #[test]
    fn test_abandoned_trial_call_frees_its_slot() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                permitted_calls_in_half_open: 1,
                ..small_config()
            },
        );
        cb.force_open();
        thread::sleep(Duration::from_millis(30));

        let permit = cb.try_acquire_permit().unwrap();
        assert!(cb.try_acquire_permit().is_err());
        drop(permit);

        assert_eq!(
            cb.state(),
            CircuitBreakerState::HalfOpen {
                admitted: 0,
                successes: 0,
                failures: 0,
            }
        );
        assert_eq!(cb.metrics().snapshot().abandoned_requests, 1);

        cb.try_acquire_permit().unwrap().finish(true);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_stale_permit_leaves_next_trial_phase_alone() {
        let cb = CircuitBreaker::new("test", small_config());
        cb.force_open();
        thread::sleep(Duration::from_millis(30));
        let stale = cb.try_acquire_permit().unwrap();

        // The trial phase that admitted `stale` ends and a new one begins
        cb.force_open();
        thread::sleep(Duration::from_millis(30));
        let current = cb.try_acquire_permit().unwrap();
        drop(stale);

        assert!(matches!(
            cb.state(),
            CircuitBreakerState::HalfOpen { admitted: 1, .. }
        ));
        current.finish(true);
    }

    #[test]
    fn test_permit_records_outcome() {
        let cb = CircuitBreaker::new("test", small_config());
        for _ in 0..4 {
            cb.try_acquire_permit().unwrap().finish(false);
        }
        assert!(matches!(cb.state(), CircuitBreakerState::Open { .. }));

        // Dropping a permit in the closed state records nothing
        let cb = CircuitBreaker::new("test", small_config());
        drop(cb.try_acquire_permit().unwrap());
        let snapshot = cb.metrics().snapshot();
        assert_eq!(snapshot.failed_requests, 0);
        assert_eq!(snapshot.successful_requests, 0);
        assert_eq!(snapshot.abandoned_requests, 1);
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        let cb = CircuitBreaker::with_defaults("test");
        call(&cb, true);
        call(&cb, false);

        let snapshot = cb.metrics().snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(cb.metrics().failure_rate(), 50.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());

        let mut config = small_config();
        config.failure_rate_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = small_config();
        config.minimum_number_of_calls = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_circuit_breaker_registry() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig::default();

        let cb1 = registry.get_or_create("10.0.0.1:80:GET", &config);
        let cb2 = registry.get_or_create("10.0.0.1:80:GET", &config);
        let cb3 = registry.get_or_create("10.0.0.2:80:GET", &config);

        assert!(Arc::ptr_eq(&cb1, &cb2));
        assert_eq!(cb3.name(), "10.0.0.2:80:GET");
        assert_eq!(registry.get_all().len(), 2);

        assert!(registry.remove("10.0.0.1:80:GET").is_some());
        assert_eq!(registry.len(), 1);

        registry.get_or_create("10.0.0.2:80:POST", &config);
        registry.get_or_create("10.0.0.20:80:GET", &config);
        assert_eq!(registry.remove_prefixed("10.0.0.2:80:"), 2);
        assert_eq!(registry.len(), 1);
    }
}
