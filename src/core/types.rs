//! # Core Types
//!
//! Data structures shared by every layer of the balancer: the candidate
//! [`ServiceInstance`], its metrics identity [`InstanceKey`], and the
//! [`RequestKey`] that ties together all attempts of one logical request.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use crate::core::error::{BalancerError, BalancerResult};

/// Service instance information
///
/// Instances are produced by discovery for every call and are never mutated by
/// the selector. Their position in the slice handed to the selector is the
/// final tie-break when two instances score the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier (defaults to `host:port`)
    pub id: String,

    /// Logical service this instance belongs to
    pub service_name: String,

    /// Host name or IP address
    pub host: String,

    /// Port number
    pub port: u16,

    /// Free-form discovery metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a new service instance whose id is its `host:port` address
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}", host, port),
            service_name: service_name.into(),
            host,
            port,
            metadata: HashMap::new(),
        }
    }

    /// Override the instance identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build an instance from a URL such as `http://10.0.0.1:8080/path`
    ///
    /// Missing ports fall back to the scheme's well-known port.
    pub fn from_url(service_name: impl Into<String>, raw: &str) -> BalancerResult<Self> {
        let url = Url::parse(raw)
            .map_err(|e| BalancerError::config(format!("Invalid instance URL '{}': {}", raw, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| BalancerError::config(format!("Instance URL '{}' has no host", raw)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BalancerError::config(format!("Instance URL '{}' has no port", raw)))?;
        Ok(Self::new(service_name, host, port))
    }

    /// Build an instance from a bare `host:port` address
    pub fn from_address(service_name: impl Into<String>, address: &str) -> BalancerResult<Self> {
        let instance = Self::from_url(service_name, &format!("http://{}", address))?;
        if !address.ends_with(&format!(":{}", instance.port)) {
            return Err(BalancerError::config(format!(
                "Instance address '{}' must be of the form host:port",
                address
            )));
        }
        Ok(instance)
    }

    /// `host:port` form of the endpoint
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for HTTP transports
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Identity used to key per-instance metrics and circuit breakers
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.service_name, self.host, self.port)
    }
}

/// Network identity of an instance.
///
/// Metrics are recorded against the endpoint rather than the discovery id, so
/// two discovery records pointing at the same `host:port` share their health.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identifier shared by every selection made for one logical request
///
/// Typically a trace or correlation id. The caller owns it; the balancer only
/// uses it as a map key. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    /// Wrap an existing identifier
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Mint a fresh random key for callers that have no trace id
    pub fn generate() -> Self {
        Self::from(Uuid::new_v4())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RequestKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<u64> for RequestKey {
    fn from(trace_id: u64) -> Self {
        Self(Arc::from(format!("{:016x}", trace_id)))
    }
}

impl From<Uuid> for RequestKey {
    fn from(id: Uuid) -> Self {
        Self(Arc::from(id.to_string()))
    }
}
