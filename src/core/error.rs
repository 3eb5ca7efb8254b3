//! # Error Handling Module
//!
//! This module defines every error the balancer can surface, using the `thiserror`
//! crate. Two layers exist:
//!
//! - [`BalancerError`] is what public operations return. Selection itself only
//!   ever produces [`BalancerError::EmptyPool`]; metrics failures and rotation
//!   contention are absorbed internally.
//! - [`CallError`] describes the outcome of one transport attempt. The dispatch
//!   layer classifies it to decide whether a retry is worthwhile.
//!
//! ## Rust Error Handling Concepts
//!
//! - `Result<T, E>` instead of exceptions: every fallible operation says so in its
//!   signature, and `?` propagates failures to the caller
//! - Enum variants replace exception hierarchies, so `match` forces callers to
//!   consider each case
//! - `thiserror` derives `Display` and `std::error::Error` from the `#[error]`
//!   attributes

use thiserror::Error;

/// Main result type used throughout the balancer
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Errors surfaced by balancer operations
#[derive(Debug, Error, Clone)]
pub enum BalancerError {
    /// The candidate list handed to the selector was empty.
    ///
    /// Fatal to the current attempt: callers must query discovery again before
    /// asking for another instance.
    #[error("No instance available: candidate pool is empty")]
    EmptyPool,

    /// Configuration-related errors (invalid values, unreadable files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Service discovery errors (backend unavailable, unknown service, etc.)
    #[error("Service discovery error: {message}")]
    ServiceDiscovery { message: String },

    /// A metrics lookup failed for one instance.
    ///
    /// Only metrics sources return this; the selector degrades it to the
    /// neutral snapshot and never propagates it.
    #[error("Metrics unavailable for instance {instance}: {reason}")]
    MetricsUnavailable { instance: String, reason: String },

    /// Circuit breaker is open, the call was not attempted
    #[error("Circuit breaker open: {name}")]
    CircuitBreakerOpen { name: String },

    /// The instance's bulkhead had no free slot, the call was not attempted
    #[error("Bulkhead full: {name}")]
    BulkheadFull { name: String },

    /// A single attempt against an upstream instance failed
    #[error("Upstream call to {instance} failed: {error}")]
    UpstreamCall { instance: String, error: CallError },

    /// Every permitted attempt failed; carries the last failure
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<BalancerError>,
    },

    /// I/O errors (configuration files, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BalancerError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a service discovery error with a custom message
    pub fn service_discovery<S: Into<String>>(message: S) -> Self {
        Self::ServiceDiscovery {
            message: message.into(),
        }
    }

    /// Create a metrics lookup error for an instance
    pub fn metrics_unavailable<S: Into<String>, R: Into<String>>(instance: S, reason: R) -> Self {
        Self::MetricsUnavailable {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if a fresh attempt could succeed where this one failed
    ///
    /// `EmptyPool` is not retryable: the candidate list must be
    /// refreshed first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitBreakerOpen { .. } | Self::BulkheadFull { .. } => true,
            Self::UpstreamCall { error, .. } => error.is_transient(),
            Self::ServiceDiscovery { .. } => true,
            _ => false,
        }
    }

    /// Get a string representation of the error type for logs and metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::EmptyPool => "empty_pool",
            Self::Configuration { .. } => "configuration_error",
            Self::ServiceDiscovery { .. } => "service_discovery_error",
            Self::MetricsUnavailable { .. } => "metrics_unavailable",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::BulkheadFull { .. } => "bulkhead_full",
            Self::UpstreamCall { .. } => "upstream_call_error",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for BalancerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for BalancerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for BalancerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Outcome of one failed transport attempt
///
/// Transports map their own failures onto these variants. The distinction
/// between `Connect` and `ReadTimeout` matters: a connect failure means the
/// request never left, while a read timeout means the upstream may already be
/// processing it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Connection could not be established
    #[error("connect failed: {0}")]
    Connect(String),

    /// The request was sent but no response arrived in time
    #[error("read timed out: {0}")]
    ReadTimeout(String),

    /// Other transport-level I/O failure
    #[error("I/O failure: {0}")]
    Io(String),

    /// The upstream answered with an error status
    #[error("upstream responded {status}: {reason}")]
    Status { status: u16, reason: String },

    /// The per-instance circuit breaker rejected the attempt
    #[error("circuit breaker open: {0}")]
    CircuitOpen(String),

    /// The per-instance bulkhead had no free slot
    #[error("bulkhead full: {0}")]
    BulkheadFull(String),

    /// Anything the transport cannot classify
    #[error("{0}")]
    Other(String),
}

impl CallError {
    /// Whether the request may have reached the upstream
    ///
    /// I/O failures mentioning "read" are treated like read timeouts.
    pub fn request_possibly_sent(&self) -> bool {
        match self {
            Self::Connect(_) | Self::CircuitOpen(_) | Self::BulkheadFull(_) => false,
            Self::ReadTimeout(_) | Self::Status { .. } => true,
            Self::Io(message) => message.to_ascii_lowercase().contains("read"),
            Self::Other(_) => true,
        }
    }

    /// Whether the failure says something about the instance's health
    ///
    /// Client errors (4xx other than 429) are the caller's fault and do not
    /// count against the instance.
    pub fn is_upstream_failure(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => true,
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_)
            | Self::ReadTimeout(_)
            | Self::Io(_)
            | Self::CircuitOpen(_)
            | Self::BulkheadFull(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Other(_) => false,
        }
    }
}
