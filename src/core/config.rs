//! # Configuration Management
//!
//! Configuration is loaded from YAML or JSON, then environment variables are
//! layered on top, then the whole tree is validated. Every section has
//! defaults, so an empty document is a valid configuration.
//!
//! ```yaml
//! rotation:
//!   idle_timeout: 1m
//!   max_entries: 100000
//! metrics:
//!   failure_window: 1m
//! logging:
//!   level: info
//!   format: json
//! defaults:
//!   response_timeout: 10s
//!   retry:
//!     max_attempts: 3
//!     wait_duration: 500ms
//!   bulkhead:
//!     max_concurrent_calls: 25
//! clients:
//!   orders:
//!     retryable_paths: ["/orders/*/status"]
//! discovery:
//!   services:
//!     orders: ["10.0.0.1:8080", "10.0.0.2:8080"]
//! ```
//!
//! Environment variables follow the pattern `ADAPTIVE_LB_<SECTION>_<FIELD>`,
//! e.g. `ADAPTIVE_LB_ROTATION_IDLE_TIMEOUT=30s`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::core::bulkhead::BulkheadConfig;
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::discovery::StaticDiscoveryConfig;
use crate::load_balancing::{InstanceMetricsConfig, RotationConfig};
use crate::observability::config::{LogConfig, LogFormat};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub rotation: RotationConfig,
    pub metrics: InstanceMetricsConfig,
    pub logging: LogConfig,
    /// Call settings for services without an entry in `clients`
    pub defaults: ClientConfig,
    /// Per-service call settings; an entry replaces `defaults` entirely
    pub clients: HashMap<String, ClientConfig>,
    pub discovery: StaticDiscoveryConfig,
}

/// Call settings for one downstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Deadline for a single attempt, after which it counts as a read timeout
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,

    pub retry: RetryConfig,

    /// Paths whose non-GET calls may still be retried after a read timeout
    ///
    /// `*` matches one path segment, a trailing `**` matches any suffix.
    pub retryable_paths: Vec<String>,

    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-instance concurrency cap
    pub bulkhead: BulkheadConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            retryable_paths: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub wait_duration: Duration,

    /// Waits are drawn uniformly from `wait * (1 ± factor)`
    pub randomized_wait_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_duration: Duration::from_millis(500),
            randomized_wait_factor: 0.5,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> BalancerResult<()> {
        if self.max_attempts == 0 {
            return Err(BalancerError::config("retry.max_attempts must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.randomized_wait_factor) {
            return Err(BalancerError::config(
                "retry.randomized_wait_factor must be in [0, 1)",
            ));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> BalancerResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(BalancerError::config("connect_timeout must be greater than zero"));
        }
        if self.response_timeout.is_zero() {
            return Err(BalancerError::config("response_timeout must be greater than zero"));
        }
        for path in &self.retryable_paths {
            if !path.starts_with('/') {
                return Err(BalancerError::config(format!(
                    "Retryable path '{}' must start with '/'",
                    path
                )));
            }
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.bulkhead.validate()
    }
}

impl BalancerConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> BalancerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BalancerError::config(format!("Failed to read config file: {}", e)))?;
        let mut config = Self::parse_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> BalancerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BalancerError::config(format!("Failed to read config file: {}", e)))?;
        let mut config: BalancerConfig = serde_json::from_str(&content)
            .map_err(|e| BalancerError::config(format!("Failed to parse JSON config: {}", e)))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML without consulting the environment
    pub fn from_yaml_str(content: &str) -> BalancerResult<Self> {
        let config = Self::parse_yaml(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_yaml(content: &str) -> BalancerResult<Self> {
        // An empty document deserializes to unit, not to an empty map
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| BalancerError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply `ADAPTIVE_LB_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> BalancerResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> BalancerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let duration = |key: &str| -> BalancerResult<Option<Duration>> {
            lookup(key)
                .map(|value| {
                    humantime::parse_duration(&value)
                        .map_err(|e| BalancerError::config(format!("Invalid {}: {}", key, e)))
                })
                .transpose()
        };

        // Rotation
        if let Some(timeout) = duration("ADAPTIVE_LB_ROTATION_IDLE_TIMEOUT")? {
            self.rotation.idle_timeout = timeout;
        }
        if let Some(interval) = duration("ADAPTIVE_LB_ROTATION_SWEEP_INTERVAL")? {
            self.rotation.sweep_interval = interval;
        }
        if let Some(max) = lookup("ADAPTIVE_LB_ROTATION_MAX_ENTRIES") {
            self.rotation.max_entries = max.parse().map_err(|e| {
                BalancerError::config(format!("Invalid ADAPTIVE_LB_ROTATION_MAX_ENTRIES: {}", e))
            })?;
        }

        // Metrics
        if let Some(window) = duration("ADAPTIVE_LB_METRICS_FAILURE_WINDOW")? {
            self.metrics.failure_window = window;
        }

        // Logging
        if let Some(level) = lookup("ADAPTIVE_LB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("ADAPTIVE_LB_LOG_FORMAT") {
            self.logging.format = format.parse::<LogFormat>()?;
        }

        // Client defaults
        if let Some(timeout) = duration("ADAPTIVE_LB_CONNECT_TIMEOUT")? {
            self.defaults.connect_timeout = timeout;
        }
        if let Some(timeout) = duration("ADAPTIVE_LB_RESPONSE_TIMEOUT")? {
            self.defaults.response_timeout = timeout;
        }
        if let Some(attempts) = lookup("ADAPTIVE_LB_RETRY_MAX_ATTEMPTS") {
            self.defaults.retry.max_attempts = attempts.parse().map_err(|e| {
                BalancerError::config(format!("Invalid ADAPTIVE_LB_RETRY_MAX_ATTEMPTS: {}", e))
            })?;
        }
        if let Some(wait) = duration("ADAPTIVE_LB_RETRY_WAIT_DURATION")? {
            self.defaults.retry.wait_duration = wait;
        }
        if let Some(max) = lookup("ADAPTIVE_LB_BULKHEAD_MAX_CONCURRENT_CALLS") {
            self.defaults.bulkhead.max_concurrent_calls = max.parse().map_err(|e| {
                BalancerError::config(format!(
                    "Invalid ADAPTIVE_LB_BULKHEAD_MAX_CONCURRENT_CALLS: {}",
                    e
                ))
            })?;
        }

        Ok(())
    }

    /// Validate the whole configuration tree
    pub fn validate(&self) -> BalancerResult<()> {
        self.rotation.validate()?;
        self.metrics.validate()?;
        self.logging.validate()?;
        self.defaults.validate()?;
        for (service, client) in &self.clients {
            client.validate().map_err(|e| {
                BalancerError::config(format!("Invalid client config for '{}': {}", service, e))
            })?;
        }
        self.discovery.validate()
    }

    /// Call settings for `service_name`
    pub fn client_config(&self, service_name: &str) -> &ClientConfig {
        self.clients.get(service_name).unwrap_or(&self.defaults)
    }
}
