//! # Rotation State Store
//!
//! Maps each logical request to a monotonically advancing position counter.
//! Every selection made for a request takes the current position and advances
//! it by one, so retries walk down the ranked candidate list instead of
//! hammering the instance that just failed.
//!
//! ## Concurrency
//!
//! - `DashMap` shards the key space, so selections for different requests only
//!   contend when their keys hash to the same shard
//! - The DashMap entry API guarantees a single counter per key even when two
//!   threads race to create it
//! - `AtomicU64::fetch_add` is the only ordering guarantee for one key: no two
//!   calls can observe the same position, and no position is skipped
//!
//! ## Eviction
//!
//! Entries carry a last-access timestamp and an insertion sequence number.
//! [`RotationStore::evict_idle`] drops entries untouched for `idle_timeout`.
//! Creation beyond `max_entries` trims the least recently used entries, oldest
//! insertion first among equal timestamps. The key being created and any entry
//! whose handle a caller still holds are never trimmed. Only one thread trims
//! at a time; the others keep selecting.
//!
//! An entry removed by eviction or [`RotationStore::release`] starts again
//! from zero on its next lookup.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::RequestKey;

/// Eviction policy for rotation entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Entries untouched for this long are eligible for removal
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Hard cap on tracked requests
    pub max_entries: usize,

    /// How often the background sweeper runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_entries: 100_000,
            sweep_interval: Duration::from_secs(15),
        }
    }
}

impl RotationConfig {
    pub fn validate(&self) -> BalancerResult<()> {
        if self.idle_timeout.is_zero() {
            return Err(BalancerError::config("rotation.idle_timeout must be greater than zero"));
        }
        if self.max_entries == 0 {
            return Err(BalancerError::config("rotation.max_entries must be at least 1"));
        }
        if self.sweep_interval.is_zero() {
            return Err(BalancerError::config("rotation.sweep_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Counter for one logical request
#[derive(Debug)]
pub struct RotationEntry {
    position: AtomicU64,
    last_access_ms: AtomicU64,
    /// Insertion order, breaks ties between equal timestamps
    seq: u64,
}

impl RotationEntry {
    fn new(now_ms: u64, seq: u64) -> Self {
        Self {
            position: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(now_ms),
            seq,
        }
    }

    /// Current position (the value the next selection will observe)
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn touch(&self, now_ms: u64) {
        self.last_access_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }
}

/// Shared handle to a rotation entry
pub type RotationHandle = Arc<RotationEntry>;

/// Concurrency-safe map from request key to rotation counter
///
/// Owned by whoever builds the selector; there is no process-wide instance.
pub struct RotationStore {
    config: RotationConfig,
    entries: DashMap<RequestKey, RotationHandle>,
    /// Tracked separately so creation never has to lock every shard
    count: AtomicUsize,
    next_seq: AtomicU64,
    trimming: AtomicBool,
    epoch: Instant,
    evictions: AtomicU64,
}

impl RotationStore {
    pub fn new(config: RotationConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            trimming: AtomicBool::new(false),
            epoch: Instant::now(),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RotationConfig::default())
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Get the counter for `key`, creating it at position 0 if unseen
    pub fn get_or_create(&self, key: &RequestKey) -> RotationHandle {
        let now = self.now_ms();
        if let Some(handle) = self.entries.get(key).map(|entry| Arc::clone(entry.value())) {
            handle.touch(now);
            return handle;
        }

        // The shard guard held by `entry` is released at the end of the match,
        // before any trimming iterates the map.
        let (handle, created) = match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let handle = Arc::new(RotationEntry::new(now, seq));
                entry.insert(Arc::clone(&handle));
                (handle, true)
            }
        };
        handle.touch(now);

        if created {
            let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
            if count > self.config.max_entries {
                self.trim_overflow(key);
            }
            gauge!("adaptive_balancer_rotation_entries")
                .set(self.count.load(Ordering::Relaxed) as f64);
        }
        handle
    }

    /// Advance the counter, returning the value before the increment
    pub fn increment_and_get(&self, handle: &RotationEntry) -> u64 {
        handle.touch(self.now_ms());
        handle.position.fetch_add(1, Ordering::AcqRel)
    }

    /// `get_or_create` followed by `increment_and_get`
    pub fn next_position(&self, key: &RequestKey) -> u64 {
        let handle = self.get_or_create(key);
        self.increment_and_get(&handle)
    }

    /// Peek at the position for `key` without creating or touching it
    pub fn position(&self, key: &RequestKey) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.value().position())
    }

    /// Drop the entry for a logical request that has completed
    pub fn release(&self, key: &RequestKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove every entry idle for at least `idle_timeout`, returning how many
    ///
    /// Entries whose handle is still held by a caller are kept.
    pub fn evict_idle(&self) -> usize {
        let now = self.now_ms();
        let idle_ms = self.config.idle_timeout.as_millis() as u64;
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            let keep = Arc::strong_count(entry) > 1
                || now.saturating_sub(entry.last_access_ms()) < idle_ms;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            self.count.fetch_sub(removed, Ordering::AcqRel);
            self.record_evictions(removed);
            debug!(removed, remaining = self.len(), "Evicted idle rotation entries");
        }
        removed
    }

    /// Spawn a tokio task that calls [`evict_idle`](Self::evict_idle) every
    /// `sweep_interval`. The task ends once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries removed by idle or capacity eviction
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut removed = 0;
        self.entries.retain(|_, _| {
            removed += 1;
            false
        });
        self.count.fetch_sub(removed, Ordering::AcqRel);
    }

    /// Trim the least recently used entries down to 90% of capacity
    ///
    /// `keep` is the key whose creation triggered the trim. A caller that loses
    /// the race for the trimming flag returns immediately.
    fn trim_overflow(&self, keep: &RequestKey) {
        if self
            .trimming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let target = self.config.max_entries - self.config.max_entries / 10;
        let excess = self.len().saturating_sub(target);
        if excess > 0 {
            let mut by_age: Vec<(u64, u64, RequestKey)> = self
                .entries
                .iter()
                .filter(|entry| entry.key() != keep && Arc::strong_count(entry.value()) == 1)
                .map(|entry| {
                    let value = entry.value();
                    (value.last_access_ms(), value.seq, entry.key().clone())
                })
                .collect();
            by_age.sort_unstable_by_key(|(last_access, seq, _)| (*last_access, *seq));

            let mut removed = 0;
            for (last_access, _, key) in by_age.into_iter().take(excess) {
                // Skip entries touched or picked up by a caller since the scan
                let evicted = self
                    .entries
                    .remove_if(&key, |_, entry| {
                        entry.last_access_ms() == last_access && Arc::strong_count(entry) == 1
                    })
                    .is_some();
                if evicted {
                    removed += 1;
                }
            }
            if removed > 0 {
                self.count.fetch_sub(removed, Ordering::AcqRel);
                self.record_evictions(removed);
                debug!(removed, max_entries = self.config.max_entries, "Rotation store over capacity");
            }
        }

        self.trimming.store(false, Ordering::Release);
    }

    fn record_evictions(&self, removed: usize) {
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        counter!("adaptive_balancer_rotation_evictions_total").increment(removed as u64);
        gauge!("adaptive_balancer_rotation_entries").set(self.len() as f64);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for RotationStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}
