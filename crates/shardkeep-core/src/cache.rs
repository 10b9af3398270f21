//! Bounded shard cache.
//!
//! [`ShardCache`] wraps one [`CachePolicy`] and the [`LoadPipeline`] used to
//! materialise misses. Policy state lives behind a single `RwLock`: every
//! mutation (admit, hit bookkeeping, evict, remove, resize, clear, hot switch)
//! takes the write guard, membership reads take the read guard.
//!
//! Loads are serialised per shard id. A second request for an id that is
//! already loading waits for the first to finish and then re-checks the
//! cache, so a shard is never loaded twice concurrently. Load and unload
//! callbacks always run with the policy lock released.

use std::collections::HashSet;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ShardResult;
use crate::pipeline::LoadPipeline;
use crate::policy::{AdmitOptions, CachePolicy, EntryStats, PolicyKind};

/// Counters and occupancy for one cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub strategy: String,
    pub capacity: usize,
    pub size: usize,
    pub keys: Vec<String>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub unload_failures: u64,
    pub hit_rate: f64,
}

/// Outcome of [`ShardCache::clear`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub removed: Vec<String>,
    /// Entries kept because their unload callback refused.
    pub failed: Vec<String>,
}

impl ClearReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    loads: u64,
    load_failures: u64,
    unload_failures: u64,
}

/// Shard id -> payload cache with injected load/unload behaviour.
pub struct ShardCache<V> {
    policy: RwLock<Box<dyn CachePolicy<V>>>,
    pipeline: LoadPipeline<V>,
    loading: Mutex<HashSet<String>>,
    load_done: Condvar,
    counters: Mutex<Counters>,
}

/// Marks a shard id as loading until dropped.
struct LoadSlot<'a, V> {
    cache: &'a ShardCache<V>,
    key: String,
}

impl<V> Drop for LoadSlot<'_, V> {
    fn drop(&mut self) {
        self.cache.loading.lock().remove(&self.key);
        self.cache.load_done.notify_all();
    }
}

enum Slot<'a, V> {
    Acquired(LoadSlot<'a, V>),
    Resolved(V),
}

impl<V: Clone + Send + Sync + 'static> ShardCache<V> {
    pub fn new(policy: Box<dyn CachePolicy<V>>, pipeline: LoadPipeline<V>) -> Self {
        Self {
            policy: RwLock::new(policy),
            pipeline,
            loading: Mutex::new(HashSet::new()),
            load_done: Condvar::new(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn pipeline(&self) -> &LoadPipeline<V> {
        &self.pipeline
    }

    /// Look up `key`, loading it with default admission options on a miss.
    ///
    /// A failed or empty load is reported as `None` and nothing is cached.
    pub fn get(&self, key: &str, load_if_missing: bool) -> Option<V> {
        if !load_if_missing {
            return self.lookup(key);
        }
        match self.get_or_load(key, AdmitOptions::default()) {
            Ok(value) => value,
            Err(e) => {
                debug!(shard_id = key, error = %e, "load failed");
                None
            }
        }
    }

    /// Look up `key`, loading and admitting it on a miss.
    pub fn get_or_load(&self, key: &str, opts: AdmitOptions) -> ShardResult<Option<V>> {
        if let Some(value) = self.lookup(key) {
            return Ok(Some(value));
        }

        let _slot = match self.acquire_slot(key) {
            Slot::Acquired(slot) => slot,
            Slot::Resolved(value) => return Ok(Some(value)),
        };

        match self.pipeline.load(key) {
            Ok(Some(value)) => {
                self.counters.lock().loads += 1;
                self.put(key, value.clone(), opts);
                debug!(shard_id = key, "loaded shard");
                Ok(Some(value))
            }
            Ok(None) => {
                self.counters.lock().load_failures += 1;
                debug!(shard_id = key, "load returned nothing");
                Ok(None)
            }
            Err(e) => {
                self.counters.lock().load_failures += 1;
                warn!(shard_id = key, error = %e, "load failed");
                Err(e)
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let value = self.policy.write().get(key);
        let mut counters = self.counters.lock();
        if value.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        value
    }

    fn acquire_slot(&self, key: &str) -> Slot<'_, V> {
        let mut loading = self.loading.lock();
        while loading.contains(key) {
            self.load_done.wait(&mut loading);
            if let Some(value) = self.policy.write().get(key) {
                return Slot::Resolved(value);
            }
        }
        // A load may have finished between the miss and taking the lock.
        let resident = {
            let mut policy = self.policy.write();
            if policy.contains(key) {
                policy.get(key)
            } else {
                None
            }
        };
        if let Some(value) = resident {
            return Slot::Resolved(value);
        }
        loading.insert(key.to_string());
        Slot::Acquired(LoadSlot {
            cache: self,
            key: key.to_string(),
        })
    }

    /// Whether `key` is currently being loaded.
    pub fn is_loading(&self, key: &str) -> bool {
        self.loading.lock().contains(key)
    }

    /// Admit a payload, evicting first when full.
    pub fn put(&self, key: &str, value: V, opts: AdmitOptions) {
        let evicted = self.policy.write().admit(key, value, opts);
        self.release_evicted(evicted);
    }

    /// Unload evicted entries. Capacity takes precedence over a refusing
    /// unload: the entry is already gone from the policy.
    fn release_evicted(&self, evicted: Vec<String>) {
        if evicted.is_empty() {
            return;
        }
        self.counters.lock().evictions += evicted.len() as u64;
        for key in evicted {
            if self.pipeline.unload(&key) {
                debug!(shard_id = %key, "evicted shard");
            } else {
                self.counters.lock().unload_failures += 1;
                warn!(shard_id = %key, "unload failed during eviction");
            }
        }
    }

    /// Remove `key` if its unload succeeds.
    pub fn remove(&self, key: &str) -> bool {
        if !self.contains(key) {
            return false;
        }
        if !self.pipeline.unload(key) {
            self.counters.lock().unload_failures += 1;
            warn!(shard_id = key, "unload refused, keeping entry");
            return false;
        }
        self.policy.write().remove(key)
    }

    /// Unload and remove every entry. Entries whose unload fails stay cached.
    pub fn clear(&self) -> ClearReport {
        let mut report = ClearReport::default();
        for key in self.keys() {
            if self.pipeline.unload(&key) {
                self.policy.write().remove(&key);
                report.removed.push(key);
            } else {
                self.counters.lock().unload_failures += 1;
                report.failed.push(key);
            }
        }
        if !report.is_complete() {
            warn!(failed = ?report.failed, "some shards could not be unloaded");
        }
        report
    }

    /// Change capacity (minimum 1), evicting down to it.
    pub fn resize(&self, capacity: usize) -> Vec<String> {
        let evicted = self.policy.write().resize(capacity.max(1));
        self.release_evicted(evicted.clone());
        info!(capacity, evicted = evicted.len(), "resized cache");
        evicted
    }

    /// Replace the active policy, re-admitting every cached entry.
    ///
    /// The old policy is drained and the new one filled under one write
    /// guard; no reader observes a half-migrated cache. Entries that do not
    /// fit the new capacity are evicted and unloaded.
    pub fn swap_policy(&self, mut next: Box<dyn CachePolicy<V>>) -> Vec<String> {
        let evicted = {
            let mut policy = self.policy.write();
            let mut evicted = Vec::new();
            for entry in policy.drain() {
                evicted.extend(next.admit(&entry.key, entry.value, entry.options));
            }
            let from = policy.kind();
            *policy = next;
            info!(from = %from, to = %policy.kind(), size = policy.len(), "switched cache policy");
            evicted
        };
        self.release_evicted(evicted.clone());
        evicted
    }

    pub fn contains(&self, key: &str) -> bool {
        self.policy.read().contains(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.policy.read().keys()
    }

    pub fn len(&self) -> usize {
        self.policy.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.policy.read().capacity()
    }

    pub fn kind(&self) -> PolicyKind {
        self.policy.read().kind()
    }

    pub fn entry_stats(&self) -> Vec<EntryStats> {
        self.policy.read().stats()
    }

    pub fn stats(&self) -> CacheStats {
        let (strategy, capacity, size, keys) = {
            let policy = self.policy.read();
            (
                policy.kind().to_string(),
                policy.capacity(),
                policy.len(),
                policy.keys(),
            )
        };
        let counters = self.counters.lock();
        let total = counters.hits + counters.misses;
        CacheStats {
            strategy,
            capacity,
            size,
            keys,
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            loads: counters.loads,
            load_failures: counters.load_failures,
            unload_failures: counters.unload_failures,
            hit_rate: if total == 0 {
                0.0
            } else {
                counters.hits as f64 / total as f64
            },
        }
    }
}
