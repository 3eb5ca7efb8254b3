//! # Service Discovery Module
//!
//! Produces the candidate list the balancer ranks. Discovery is an external
//! collaborator: the balancer only needs `instances(service_name)` and treats
//! the returned order as the final tie-break between equally scored instances.
//!
//! ## Rust Concepts Used
//!
//! - `async_trait` for async methods in traits, so network-backed registries
//!   can implement the same interface as the static one
//! - `DashMap` for thread-safe concurrent access to the registry
//! - `tokio::sync::broadcast` for change notifications

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::ServiceInstance;

/// Service discovery trait that all discovery implementations must implement
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Current instances of `service_name`, in discovery order
    ///
    /// An unknown service yields an empty list rather than an error; the
    /// balancer turns that into `EmptyPool`.
    async fn instances(&self, service_name: &str) -> BalancerResult<Vec<ServiceInstance>>;

    /// Register a service instance
    async fn register(&self, instance: ServiceInstance) -> BalancerResult<()>;

    /// Deregister a service instance
    async fn deregister(&self, service_name: &str, instance_id: &str) -> BalancerResult<()>;

    /// Subscribe to registration changes
    fn watch_changes(&self) -> ServiceChangeReceiver;
}

/// Service change event types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceChangeEvent {
    /// A new service instance was registered
    Registered(ServiceInstance),
    /// A service instance was deregistered; carries the removed record
    Deregistered(ServiceInstance),
}

/// Type alias for service change event receiver
pub type ServiceChangeReceiver = broadcast::Receiver<ServiceChangeEvent>;

/// Type alias for service change event sender
pub type ServiceChangeSender = broadcast::Sender<ServiceChangeEvent>;

/// Static discovery configuration: service name to `host:port` addresses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticDiscoveryConfig {
    #[serde(default)]
    pub services: HashMap<String, Vec<String>>,
}

impl StaticDiscoveryConfig {
    pub fn validate(&self) -> BalancerResult<()> {
        for (service_name, addresses) in &self.services {
            for address in addresses {
                ServiceInstance::from_address(service_name.as_str(), address)?;
            }
        }
        Ok(())
    }
}

/// Static service discovery for testing and simple deployments
///
/// Instances are kept in registration order. Re-registering an instance id
/// replaces it in place.
pub struct StaticDiscovery {
    services: DashMap<String, Vec<ServiceInstance>>,
    change_sender: ServiceChangeSender,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        let (change_sender, _) = broadcast::channel(100);
        Self {
            services: DashMap::new(),
            change_sender,
        }
    }

    /// Build a registry from configured addresses
    pub fn from_config(config: &StaticDiscoveryConfig) -> BalancerResult<Self> {
        let discovery = Self::new();
        for (service_name, addresses) in &config.services {
            for address in addresses {
                let instance = ServiceInstance::from_address(service_name.as_str(), address)?;
                discovery.add_static_instance(instance);
            }
        }
        info!(
            services = discovery.services.len(),
            "Static service discovery initialised"
        );
        Ok(discovery)
    }

    pub fn add_static_instance(&self, instance: ServiceInstance) {
        {
            let mut instances = self
                .services
                .entry(instance.service_name.clone())
                .or_default();
            match instances.iter_mut().find(|existing| existing.id == instance.id) {
                Some(existing) => *existing = instance.clone(),
                None => instances.push(instance.clone()),
            }
        }
        debug!(instance = %instance, "Registered static instance");
        let _ = self.change_sender.send(ServiceChangeEvent::Registered(instance));
    }

    /// Names of all known services
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn instances(&self, service_name: &str) -> BalancerResult<Vec<ServiceInstance>> {
        Ok(self
            .services
            .get(service_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn register(&self, instance: ServiceInstance) -> BalancerResult<()> {
        if instance.host.is_empty() {
            return Err(BalancerError::service_discovery(format!(
                "Instance {} has an empty host",
                instance.id
            )));
        }
        self.add_static_instance(instance);
        Ok(())
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> BalancerResult<()> {
        let removed = self.services.get_mut(service_name).and_then(|mut instances| {
            let index = instances.iter().position(|instance| instance.id == instance_id)?;
            Some(instances.remove(index))
        });

        if let Some(instance) = removed {
            debug!(service_name, instance_id, "Deregistered static instance");
            let _ = self
                .change_sender
                .send(ServiceChangeEvent::Deregistered(instance));
        }
        Ok(())
    }

    fn watch_changes(&self) -> ServiceChangeReceiver {
        self.change_sender.subscribe()
    }
}
