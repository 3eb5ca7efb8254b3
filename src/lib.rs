//! # Adaptive Balancer Library
//!
//! Client-side instance selection for calls to replicated downstream services.
//! Each attempt picks the instance with the lowest recent failure rate, then
//! the lowest concurrency, then the earliest discovery position. Attempts that
//! belong to the same logical request advance through that ranking, so a
//! retry never blindly repeats the instance that just failed.
//!
//! ## Module Layout
//!
//! - `core`: error types, configuration, instance/key types, circuit breaker,
//!   bulkhead
//! - `load_balancing`: the selector, its rotation store and metrics sources
//! - `discovery`: where candidate lists come from
//! - `dispatch`: retrying, load-balanced execution of a caller's transport
//! - `observability`: logging setup
//!
//! ## Re-exports
//! - `pub use` re-exports the types most callers need at the crate root, so
//!   `use adaptive_balancer::AdaptiveBalancer` works without knowing the
//!   module tree

/// Core functionality including error types, configuration, and basic data structures
pub mod core;

/// Failure-rate and concurrency aware selection with per-request rotation
pub mod load_balancing;

/// Service discovery interface and the static registry
pub mod discovery;

/// Load-balanced call execution with circuit breaking and retry
pub mod dispatch;

/// Logging configuration and subscriber setup
pub mod observability;

/// Main error type used throughout the crate
pub use crate::core::error::{BalancerError, BalancerResult, CallError};

/// Root configuration and per-service call settings
pub use crate::core::config::{BalancerConfig, ClientConfig, RetryConfig};

pub use crate::core::bulkhead::{BulkheadConfig, BulkheadRegistry};

pub use crate::core::types::{InstanceKey, RequestKey, ServiceInstance};

/// The selector and the state it depends on
pub use crate::load_balancing::{
    AdaptiveBalancer, InstanceMetrics, InstanceMetricsSource, InstanceSelector, RotationConfig,
    RotationStore,
};

pub use crate::discovery::{ServiceDiscovery, StaticDiscovery};

pub use crate::dispatch::{AttemptContext, CallRequest, LoadBalancedExecutor};
