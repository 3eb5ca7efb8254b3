//! Per-instance bulkhead
//!
//! Caps how many calls may be in flight to one `host:port` at a time. A call
//! that finds the bulkhead full waits up to `max_wait_duration` for a slot and
//! is rejected after that, so one slow instance cannot absorb every caller.

use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::core::error::{BalancerError, BalancerResult};

/// Bulkhead limits for one instance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once
    pub max_concurrent_calls: usize,

    /// How long a call may wait for a free slot; zero rejects immediately
    #[serde(with = "humantime_serde")]
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> BalancerResult<()> {
        if self.max_concurrent_calls == 0 {
            return Err(BalancerError::config(
                "bulkhead.max_concurrent_calls must be at least 1",
            ));
        }
        if self.max_concurrent_calls > Semaphore::MAX_PERMITS {
            return Err(BalancerError::config(format!(
                "bulkhead.max_concurrent_calls must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Concurrency limit for one named target
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    rejected: AtomicU64,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_calls));
        Self {
            name: name.into(),
            config,
            semaphore,
            rejected: AtomicU64::new(0),
        }
    }

    /// Take a slot, waiting at most `max_wait_duration`
    ///
    /// The slot is returned when the permit is dropped, including when the
    /// calling future is cancelled.
    pub async fn acquire(&self) -> BalancerResult<BulkheadPermit> {
        let acquired = if self.config.max_wait_duration.is_zero() {
            Arc::clone(&self.semaphore).try_acquire_owned().ok()
        } else {
            tokio::time::timeout(
                self.config.max_wait_duration,
                Arc::clone(&self.semaphore).acquire_owned(),
            )
            .await
            .ok()
            .and_then(Result::ok)
        };

        match acquired {
            Some(permit) => Ok(BulkheadPermit { _permit: permit }),
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                counter!("adaptive_balancer_bulkhead_rejections_total", "bulkhead" => self.name.clone())
                    .increment(1);
                debug!(
                    bulkhead = %self.name,
                    max_concurrent_calls = self.config.max_concurrent_calls,
                    "Bulkhead full"
                );
                Err(BalancerError::BulkheadFull {
                    name: self.name.clone(),
                })
            }
        }
    }

    /// Slots currently free
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Calls rejected so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }
}

/// One occupied bulkhead slot, released on drop
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bulkheads keyed by instance address
pub struct BulkheadRegistry {
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    pub fn new() -> Self {
        Self {
            bulkheads: DashMap::new(),
        }
    }

    /// `config` only applies when the bulkhead is created
    pub fn get_or_create(&self, name: &str, config: &BulkheadConfig) -> Arc<Bulkhead> {
        if let Some(bulkhead) = self.bulkheads.get(name) {
            return Arc::clone(bulkhead.value());
        }
        let bulkhead = self
            .bulkheads
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(name, config.clone())));
        Arc::clone(bulkhead.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.remove(name).map(|(_, bulkhead)| bulkhead)
    }

    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }
}

impl Default for BulkheadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
