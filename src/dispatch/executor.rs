//! # Load-Balanced Call Execution
//!
//! Wraps a caller-supplied transport closure with the full client pipeline.
//! Retry is the outer layer; every attempt runs through load balancing and then
//! through the circuit breaker:
//!
//! ```text
//! execute ──► attempt 1: discover ─► select ─► bulkhead ─► breaker ─► call ─► record
//!         └─► wait ─► attempt 2: discover ─► select ─► bulkhead ─► breaker ─► call ─► record
//! ```
//!
//! All attempts of one call share the request key, so the rotation store
//! advances between them and a retry lands on the next-ranked instance.
//!
//! Bulkheads are per `host:port`. Circuit breakers are per `host:port` and
//! operation, where the operation is a fixed name chosen by the caller (the
//! HTTP method unless [`CallRequest::with_operation`] says otherwise), never
//! the raw path.
//!
//! ## Rust Concepts Used
//!
//! - The transport is a generic `FnMut(AttemptContext) -> Future`, so the
//!   executor works with any HTTP client without depending on one
//! - `tokio::time::timeout` enforces the per-attempt response deadline
//! - Every slot an attempt takes is an RAII guard (`BulkheadPermit`,
//!   `CallPermit`, `InFlightCall`), so a caller dropping the returned future
//!   mid-attempt gives all of them back

use dashmap::DashMap;
use http::Method;
use metrics::counter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::bulkhead::BulkheadRegistry;
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::{BalancerConfig, ClientConfig};
use crate::core::error::{BalancerError, BalancerResult, CallError};
use crate::core::types::{RequestKey, ServiceInstance};
use crate::discovery::{ServiceChangeEvent, ServiceDiscovery, StaticDiscovery};
use crate::dispatch::retry::RetryPolicy;
use crate::load_balancing::{AdaptiveBalancer, InstanceMetrics, RotationStore};

/// One logical downstream call
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub service_name: String,
    pub method: Method,
    pub path: String,
    /// Fixed name of the operation, used to key circuit breakers
    pub operation: String,
    /// Shared by every attempt of this call
    pub request_key: RequestKey,
}

impl CallRequest {
    /// Create a request with a freshly generated request key
    ///
    /// The operation defaults to the HTTP method name.
    pub fn new(service_name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            operation: method.as_str().to_string(),
            method,
            path: path.into(),
            request_key: RequestKey::generate(),
        }
    }

    /// Name the operation, e.g. a route template like `GET /orders/{id}` or a
    /// client method name
    ///
    /// Calls sharing an operation name share circuit breakers, so the name
    /// should not contain resource ids.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Reuse an existing key, typically the inbound trace id
    pub fn with_request_key(mut self, request_key: impl Into<RequestKey>) -> Self {
        self.request_key = request_key.into();
        self
    }

    /// Circuit breaker name for this operation on `instance`
    pub fn circuit_breaker_name(&self, instance: &ServiceInstance) -> String {
        format!("{}:{}", instance.address(), self.operation)
    }
}

/// What the transport closure gets for one attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub instance: ServiceInstance,
    /// 1-based attempt number
    pub attempt: u32,
    /// Rotation position that selected `instance`
    pub position: u64,
    pub request_key: RequestKey,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl AttemptContext {
    /// Absolute URL for `path` on the selected instance
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.instance.base_url(), path)
    }
}

/// Per-endpoint state the executor keeps, shared with the discovery watcher
#[derive(Clone)]
struct InstanceState {
    balancer: Arc<AdaptiveBalancer>,
    metrics: Arc<InstanceMetrics>,
    breakers: Arc<CircuitBreakerRegistry>,
    bulkheads: Arc<BulkheadRegistry>,
}

impl InstanceState {
    fn forget(&self, instance: &ServiceInstance) {
        let address = instance.address();
        self.metrics.forget(instance);
        self.balancer.forget_instance(instance);
        self.bulkheads.remove(&address);
        let breakers = self.breakers.remove_prefixed(&format!("{}:", address));
        debug!(instance = %address, breakers, "Dropped state of departed instance");
    }
}

/// Discovery, selection, bulkheads, circuit breaking and retry for downstream calls
pub struct LoadBalancedExecutor {
    config: Arc<BalancerConfig>,
    discovery: Arc<dyn ServiceDiscovery>,
    state: InstanceState,
    policies: DashMap<String, Arc<RetryPolicy>>,
}

impl LoadBalancedExecutor {
    /// Build an executor with its own metrics and rotation state
    pub fn new(config: BalancerConfig, discovery: Arc<dyn ServiceDiscovery>) -> BalancerResult<Self> {
        let metrics = Arc::new(InstanceMetrics::new(config.metrics.clone()));
        let rotation = Arc::new(RotationStore::new(config.rotation.clone()));
        Self::with_components(config, discovery, metrics, rotation)
    }

    /// Build an executor backed by the static discovery section of `config`
    pub fn from_config(config: BalancerConfig) -> BalancerResult<Self> {
        let discovery = Arc::new(StaticDiscovery::from_config(&config.discovery)?);
        Self::new(config, discovery)
    }

    /// Build an executor around shared metrics and rotation state
    pub fn with_components(
        config: BalancerConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        metrics: Arc<InstanceMetrics>,
        rotation: Arc<RotationStore>,
    ) -> BalancerResult<Self> {
        config.validate()?;
        let balancer = Arc::new(AdaptiveBalancer::new(metrics.clone(), rotation));
        info!(
            services = config.clients.len(),
            rotation_max_entries = config.rotation.max_entries,
            "Load-balanced executor created"
        );
        Ok(Self {
            config: Arc::new(config),
            discovery,
            state: InstanceState {
                balancer,
                metrics,
                breakers: Arc::new(CircuitBreakerRegistry::new()),
                bulkheads: Arc::new(BulkheadRegistry::new()),
            },
            policies: DashMap::new(),
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn balancer(&self) -> &Arc<AdaptiveBalancer> {
        &self.state.balancer
    }

    pub fn metrics(&self) -> &Arc<InstanceMetrics> {
        &self.state.metrics
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.state.breakers
    }

    pub fn bulkheads(&self) -> &BulkheadRegistry {
        &self.state.bulkheads
    }

    /// Drop metrics, statistics, bulkhead and circuit breakers of `instance`
    pub fn forget_instance(&self, instance: &ServiceInstance) {
        self.state.forget(instance);
    }

    /// Start the rotation store's idle sweeper and the discovery watcher
    ///
    /// The watcher forgets an endpoint once discovery deregisters it and no
    /// other record of the same service still points at it. Both tasks end on
    /// their own once the store or the discovery is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.state.balancer.rotation().spawn_sweeper(),
            self.spawn_discovery_watcher(),
        ]
    }

    fn spawn_discovery_watcher(&self) -> JoinHandle<()> {
        let mut changes = self.discovery.watch_changes();
        let discovery = Arc::downgrade(&self.discovery);
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                let instance = match changes.recv().await {
                    Ok(ServiceChangeEvent::Deregistered(instance)) => instance,
                    Ok(ServiceChangeEvent::Registered(_)) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Discovery watcher lagged behind change events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(source) = discovery.upgrade() else {
                    break;
                };
                let key = instance.key();
                let still_listed = source
                    .instances(&instance.service_name)
                    .await
                    .map(|current| current.iter().any(|other| other.key() == key))
                    .unwrap_or(true);
                if !still_listed {
                    state.forget(&instance);
                }
            }
        })
    }

    /// Run `call` against instances of `request.service_name` until it
    /// succeeds, fails with a non-retryable error, or attempts run out
    ///
    /// # Errors
    /// * `EmptyPool` - discovery returned no instances; never retried
    /// * `UpstreamCall` - the only attempt, or a non-retryable one, failed
    /// * `RetriesExhausted` - every permitted attempt failed
    pub async fn execute<T, F, Fut>(&self, request: &CallRequest, mut call: F) -> BalancerResult<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let client = self.config.client_config(&request.service_name);
        let policy = self.policy(&request.service_name)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.attempt(request, client, attempt, &mut call).await
            {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            request_key = %request.request_key,
                            service = %request.service_name,
                            attempt,
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !policy.should_retry(&request.method, &request.path, &error) {
                debug!(
                    request_key = %request.request_key,
                    error_type = error.error_type(),
                    attempt,
                    "Call failed with a non-retryable error"
                );
                return Err(error);
            }

            if attempt >= policy.max_attempts() {
                warn!(
                    request_key = %request.request_key,
                    service = %request.service_name,
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(if attempt == 1 {
                    error
                } else {
                    BalancerError::RetriesExhausted {
                        attempts: attempt,
                        last_error: Box::new(error),
                    }
                });
            }

            let wait = policy.next_wait();
            counter!("adaptive_balancer_retries_total", "service" => request.service_name.clone())
                .increment(1);
            info!(
                request_key = %request.request_key,
                service = %request.service_name,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "Retrying call"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        request: &CallRequest,
        client: &ClientConfig,
        attempt: u32,
        call: &mut F,
    ) -> BalancerResult<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let candidates = self.discovery.instances(&request.service_name).await?;
        let selection = self
            .state
            .balancer
            .select_with_position(&request.request_key, &candidates)?;
        let instance = selection.instance.clone();
        let position = selection.position;
        let address = instance.address();

        let bulkhead = self.state.bulkheads.get_or_create(&address, &client.bulkhead);
        let _slot = match bulkhead.acquire().await {
            Ok(slot) => slot,
            Err(_) => {
                // Counted as a failed call so the instance sinks in the ranking
                self.state.metrics.start_call(&instance).finish(false);
                debug!(
                    request_key = %request.request_key,
                    bulkhead = %address,
                    attempt,
                    "Bulkhead rejected attempt"
                );
                return Err(BalancerError::UpstreamCall {
                    error: CallError::BulkheadFull(address.clone()),
                    instance: address,
                });
            }
        };

        let breaker_name = request.circuit_breaker_name(&instance);
        let breaker = self
            .state
            .breakers
            .get_or_create(&breaker_name, &client.circuit_breaker);
        let permit = match breaker.try_acquire_permit() {
            Ok(permit) => permit,
            Err(_) => {
                self.state.metrics.start_call(&instance).finish(false);
                debug!(
                    request_key = %request.request_key,
                    circuit_breaker = %breaker_name,
                    attempt,
                    "Circuit breaker rejected attempt"
                );
                return Err(BalancerError::UpstreamCall {
                    instance: address,
                    error: CallError::CircuitOpen(breaker_name),
                });
            }
        };

        let context = AttemptContext {
            instance: instance.clone(),
            attempt,
            position,
            request_key: request.request_key.clone(),
            connect_timeout: client.connect_timeout,
            response_timeout: client.response_timeout,
        };

        let in_flight = self.state.metrics.start_call(&instance);
        let outcome = match tokio::time::timeout(client.response_timeout, call(context)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::ReadTimeout(format!(
                "no response within {:?}",
                client.response_timeout
            ))),
        };

        match outcome {
            Ok(value) => {
                in_flight.finish(true);
                permit.finish(true);
                Ok(value)
            }
            Err(error) => {
                let unhealthy = error.is_upstream_failure();
                in_flight.finish(!unhealthy);
                permit.finish(!unhealthy);
                debug!(
                    request_key = %request.request_key,
                    instance = %instance.address(),
                    attempt,
                    error = %error,
                    "Attempt failed"
                );
                Err(BalancerError::UpstreamCall {
                    instance: address,
                    error,
                })
            }
        }
    }

    fn policy(&self, service_name: &str) -> BalancerResult<Arc<RetryPolicy>> {
        if let Some(policy) = self.policies.get(service_name) {
            return Ok(Arc::clone(policy.value()));
        }
        let policy = Arc::new(RetryPolicy::from_config(
            self.config.client_config(service_name),
        )?);
        self.policies
            .insert(service_name.to_string(), Arc::clone(&policy));
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerState;
    use crate::core::config::RetryConfig;
    use std::sync::Mutex;

    fn fast_config() -> BalancerConfig {
        let mut config = BalancerConfig::default();
        config.defaults.retry = RetryConfig {
            max_attempts: 3,
            wait_duration: Duration::from_millis(1),
            randomized_wait_factor: 0.0,
        };
        config
    }

    async fn executor_with(hosts: &[&str], config: BalancerConfig) -> LoadBalancedExecutor {
        let discovery = Arc::new(StaticDiscovery::new());
        for host in hosts {
            discovery
                .register(ServiceInstance::new("orders", *host, 8080))
                .await
                .unwrap();
        }
        LoadBalancedExecutor::new(config, discovery).unwrap()
    }

    #[test]
    fn test_operation_defaults_to_method() {
        let instance = ServiceInstance::new("orders", "10.0.0.1", 8080);
        let request = CallRequest::new("orders", Method::POST, "/orders/7?dry_run=1");
        assert_eq!(request.operation, "POST");
        assert_eq!(request.circuit_breaker_name(&instance), "10.0.0.1:8080:POST");

        let named = request.with_operation("createOrder");
        assert_eq!(named.circuit_breaker_name(&instance), "10.0.0.1:8080:createOrder");
    }

    #[tokio::test]
    async fn test_resource_ids_share_one_breaker() {
        let executor = executor_with(&["10.0.0.1"], fast_config()).await;

        for id in 0..1000 {
            let request = CallRequest::new("orders", Method::GET, format!("/orders/{}", id));
            executor
                .execute(&request, |_| async { Ok::<_, CallError>(()) })
                .await
                .unwrap();
        }
        assert_eq!(executor.circuit_breakers().len(), 1);
        let breaker = executor.circuit_breakers().get("10.0.0.1:8080:GET").unwrap();
        assert_eq!(breaker.metrics().snapshot().successful_requests, 1000);

        let named = CallRequest::new("orders", Method::GET, "/orders/1").with_operation("getOrder");
        executor
            .execute(&named, |_| async { Ok::<_, CallError>(()) })
            .await
            .unwrap();
        assert!(executor.circuit_breakers().get("10.0.0.1:8080:getOrder").is_some());
        assert_eq!(executor.bulkheads().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_trial_call_does_not_wedge_breaker() {
        let mut config = fast_config();
        config.defaults.circuit_breaker.wait_duration_in_open_state = Duration::from_millis(20);
        config.defaults.circuit_breaker.permitted_calls_in_half_open = 1;
        let executor = executor_with(&["10.0.0.1"], config).await;
        let instance = ServiceInstance::new("orders", "10.0.0.1", 8080);

        let breaker = executor
            .circuit_breakers()
            .get_or_create("10.0.0.1:8080:GET", &executor.config().defaults.circuit_breaker);
        breaker.force_open();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let request = CallRequest::new("orders", Method::GET, "/orders");
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            executor.execute(&request, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CallError>("late")
            }),
        )
        .await;
        assert!(cancelled.is_err());

        // The trial slot, the bulkhead slot and the in-flight count are all back
        assert_eq!(
            breaker.state(),
            CircuitBreakerState::HalfOpen {
                admitted: 0,
                successes: 0,
                failures: 0,
            }
        );
        let bulkhead = executor.bulkheads().get("10.0.0.1:8080").unwrap();
        assert_eq!(
            bulkhead.available_permits(),
            executor.config().defaults.bulkhead.max_concurrent_calls
        );
        assert_eq!(executor.metrics().calling(&instance), 0);

        let request = CallRequest::new("orders", Method::GET, "/orders");
        let result = executor
            .execute(&request, |_| async { Ok::<_, CallError>("recovered") })
            .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_forget_instance_drops_per_endpoint_state() {
        let executor = executor_with(&["10.0.0.1", "10.0.0.2"], fast_config()).await;
        for method in [Method::GET, Method::POST] {
            let request = CallRequest::new("orders", method, "/orders").with_request_key("same");
            executor
                .execute(&request, |_| async { Ok::<_, CallError>(()) })
                .await
                .unwrap();
        }

        let departed = ServiceInstance::new("orders", "10.0.0.1", 8080);
        executor.forget_instance(&departed);

        assert!(executor.circuit_breakers().get("10.0.0.1:8080:GET").is_none());
        assert!(executor.circuit_breakers().get("10.0.0.2:8080:POST").is_some());
        assert!(executor.bulkheads().get("10.0.0.1:8080").is_none());
        assert_eq!(executor.metrics().tracked_instances(), 1);
        assert!(!executor
            .balancer()
            .stats()
            .instance_stats
            .contains_key("10.0.0.1:8080"));
    }

    #[tokio::test]
    async fn test_first_attempt_uses_best_instance() {
        let executor = executor_with(&["10.0.0.1", "10.0.0.2"], fast_config()).await;
        let request = CallRequest::new("orders", Method::GET, "/orders");

        let host = executor
            .execute(&request, |ctx| async move { Ok::<_, CallError>(ctx.instance.host) })
            .await
            .unwrap();
        assert_eq!(host, "10.0.0.1");
        assert_eq!(executor.metrics().calling(&ServiceInstance::new("orders", "10.0.0.1", 8080)), 0);
    }

    #[tokio::test]
    async fn test_retry_moves_to_next_instance() {
        let executor = executor_with(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], fast_config()).await;
        let request = CallRequest::new("orders", Method::POST, "/orders");
        let seen = Mutex::new(Vec::new());

        let result = executor
            .execute(&request, |ctx| {
                seen.lock().unwrap().push((ctx.attempt, ctx.instance.host.clone()));
                async move {
                    if ctx.attempt == 1 {
                        Err(CallError::Connect("refused".to_string()))
                    } else {
                        Ok(ctx.instance.host)
                    }
                }
            })
            .await
            .unwrap();

        // The failed instance drops to last place, so position 1 of the fresh
        // ranking [.2, .3, .1] is .3
        assert_eq!(result, "10.0.0.3");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, "10.0.0.1".to_string()), (2, "10.0.0.3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_pool_is_not_retried() {
        let executor = executor_with(&[], fast_config()).await;
        let request = CallRequest::new("orders", Method::GET, "/orders");
        let mut calls = 0;

        let result = executor
            .execute(&request, |_| {
                calls += 1;
                async { Ok::<_, CallError>(()) }
            })
            .await;

        assert!(matches!(result, Err(BalancerError::EmptyPool)));
        assert_eq!(calls, 0);
        assert!(executor.balancer().rotation().is_empty());
    }

    #[tokio::test]
    async fn test_read_timeout_on_post_is_not_retried() {
        let mut config = fast_config();
        config.defaults.response_timeout = Duration::from_millis(20);
        let executor = executor_with(&["10.0.0.1", "10.0.0.2"], config).await;
        let request = CallRequest::new("orders", Method::POST, "/orders");

        let result = executor
            .execute(&request, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CallError>(())
            })
            .await;

        match result {
            Err(BalancerError::UpstreamCall { instance, error }) => {
                assert_eq!(instance, "10.0.0.1:8080");
                assert!(matches!(error, CallError::ReadTimeout(_)));
            }
            other => panic!("expected read timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let executor = executor_with(&["10.0.0.1", "10.0.0.2"], fast_config()).await;
        let request = CallRequest::new("orders", Method::GET, "/orders");

        let result = executor
            .execute(&request, |_| async {
                Err::<(), _>(CallError::Status {
                    status: 503,
                    reason: "Service Unavailable".to_string(),
                })
            })
            .await;

        match result {
            Err(BalancerError::RetriesExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.error_type(), "upstream_call_error");
            }
            other => panic!("expected exhausted retries, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_errors_do_not_count_against_instance() {
        let executor = executor_with(&["10.0.0.1"], fast_config()).await;
        let request = CallRequest::new("orders", Method::GET, "/orders/missing");

        let result = executor
            .execute(&request, |_| async {
                Err::<(), _>(CallError::Status {
                    status: 404,
                    reason: "Not Found".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(BalancerError::UpstreamCall { .. })));
        let instance = ServiceInstance::new("orders", "10.0.0.1", 8080);
        assert_eq!(executor.metrics().failure_rate(&instance), 0.0);
    }
}
