//! Memory-pressure driven unloading.
//!
//! Independent of the cache policy's capacity eviction: when system memory
//! rises above `memory_threshold`, [`UnloadStrategy::check_and_unload`]
//! releases a pressure-proportional number of cached shards, preferring
//! shards no cached shard depends on.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ShardError, ShardResult};
use crate::manager::ShardManager;
use crate::policy::EntryStats;
use crate::source::ShardPayload;
use crate::telemetry::{system_probe, ResourceProbe};
use crate::worker::BackgroundWorker;

const LRU_WEIGHT: f64 = 0.7;
const MEMORY_WEIGHT: f64 = 0.3;

/// Candidate ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadMode {
    /// Shards without cached dependents first, least recently used first.
    #[default]
    DependencyAware,
    /// Plain least recently used.
    Lru,
    /// Dependency filter, then 0.7 × recency rank + 0.3 × footprint rank.
    Hybrid,
}

impl fmt::Display for UnloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DependencyAware => "dependency_aware",
            Self::Lru => "lru",
            Self::Hybrid => "hybrid",
        })
    }
}

impl FromStr for UnloadMode {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "dependencyaware" | "dependency" => Ok(Self::DependencyAware),
            "lru" => Ok(Self::Lru),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ShardError::Config {
                message: format!("unknown unload mode: {}", s),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnloadConfig {
    /// System memory percentage above which shards are released.
    pub memory_threshold: f32,
    /// Never shrink the cache below this many shards.
    pub min_cache_size: usize,
    pub mode: UnloadMode,
    pub check_interval_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for UnloadConfig {
    fn default() -> Self {
        Self {
            memory_threshold: 85.0,
            min_cache_size: 1,
            mode: UnloadMode::DependencyAware,
            check_interval_ms: 5000,
            stop_timeout_ms: 5000,
        }
    }
}

impl UnloadConfig {
    pub fn with_threshold(mut self, memory_threshold: f32) -> Self {
        self.memory_threshold = memory_threshold;
        self
    }

    pub fn with_min_cache_size(mut self, min_cache_size: usize) -> Self {
        self.min_cache_size = min_cache_size;
        self
    }

    pub fn with_mode(mut self, mode: UnloadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }
}

/// Number of shards to release.
///
/// Zero unless memory is above the threshold and the cache holds more than
/// `min_cache_size` shards; otherwise
/// `max(1, min(round(cached * pressure * 0.5), cached - min_cache_size))`
/// with `pressure = (memory - threshold) / (100 - threshold)`.
pub fn eviction_count(
    cached: usize,
    memory_percent: f32,
    memory_threshold: f32,
    min_cache_size: usize,
) -> usize {
    if memory_percent <= memory_threshold || cached <= min_cache_size {
        return 0;
    }
    let headroom = (100.0 - memory_threshold).max(f32::EPSILON) as f64;
    let pressure = ((memory_percent - memory_threshold) as f64 / headroom).clamp(0.0, 1.0);
    let scaled = (cached as f64 * pressure * 0.5).round() as usize;
    scaled.min(cached - min_cache_size).max(1)
}

fn by_recency(a: &EntryStats, b: &EntryStats) -> Ordering {
    a.last_access
        .cmp(&b.last_access)
        .then_with(|| a.key.cmp(&b.key))
}

/// Rank cached entries for release, first released first.
///
/// `dependents` maps a shard to the shards that depend on it; only cached
/// dependents count.
pub fn rank_candidates(
    entries: &[EntryStats],
    dependents: &HashMap<String, BTreeSet<String>>,
    mode: UnloadMode,
) -> Vec<String> {
    let cached: HashSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();
    let mut pool: Vec<&EntryStats> = match mode {
        UnloadMode::Lru => entries.iter().collect(),
        UnloadMode::DependencyAware | UnloadMode::Hybrid => {
            let leaves: Vec<&EntryStats> = entries
                .iter()
                .filter(|e| {
                    dependents
                        .get(&e.key)
                        .map_or(true, |deps| deps.iter().all(|d| !cached.contains(d.as_str())))
                })
                .collect();
            if leaves.is_empty() {
                entries.iter().collect()
            } else {
                leaves
            }
        }
    };
    pool.sort_by(|a, b| by_recency(a, b));

    if mode != UnloadMode::Hybrid {
        return pool.into_iter().map(|e| e.key.clone()).collect();
    }

    let mut by_size: Vec<&str> = pool.iter().map(|e| e.key.as_str()).collect();
    let size_of: HashMap<&str, f64> = pool.iter().map(|e| (e.key.as_str(), e.size)).collect();
    by_size.sort_by(|a, b| {
        size_of[b]
            .partial_cmp(&size_of[a])
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    let memory_rank: HashMap<&str, usize> =
        by_size.iter().enumerate().map(|(rank, key)| (*key, rank)).collect();

    let mut scored: Vec<(f64, usize, &str)> = pool
        .iter()
        .enumerate()
        .map(|(lru_rank, e)| {
            let score = LRU_WEIGHT * lru_rank as f64
                + MEMORY_WEIGHT * memory_rank[e.key.as_str()] as f64;
            (score, lru_rank, e.key.as_str())
        })
        .collect();
    scored.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored.into_iter().map(|(_, _, key)| key.to_string()).collect()
}

/// Proactive unloader for one [`ShardManager`].
pub struct UnloadStrategy<V: ShardPayload> {
    manager: Arc<ShardManager<V>>,
    probe: Arc<dyn ResourceProbe>,
    config: UnloadConfig,
    watcher: Mutex<Option<BackgroundWorker>>,
}

impl<V: ShardPayload> UnloadStrategy<V> {
    pub fn new(manager: Arc<ShardManager<V>>, config: UnloadConfig) -> Self {
        Self::with_probe(manager, config, system_probe())
    }

    pub fn with_probe(
        manager: Arc<ShardManager<V>>,
        config: UnloadConfig,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            manager,
            probe,
            config,
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &UnloadConfig {
        &self.config
    }

    /// Shards that would be released at the current memory reading, in order.
    pub fn plan(&self) -> ShardResult<Vec<String>> {
        let memory = self.probe.memory_percent();
        let entries = self.manager.entry_stats();
        let count = eviction_count(
            entries.len(),
            memory,
            self.config.memory_threshold,
            self.config.min_cache_size,
        );
        if count == 0 {
            return Ok(Vec::new());
        }

        let dependents = self.manager.store().with_model(self.manager.model(), |meta| {
            meta.reverse_index().clone()
        })?;
        let mut ranked = rank_candidates(&entries, &dependents, self.config.mode);
        ranked.truncate(count);
        Ok(ranked)
    }

    /// One pass: release shards if memory is above the threshold. Returns the
    /// shards released. Refused unloads are skipped, not retried.
    pub fn check_and_unload(&self) -> ShardResult<Vec<String>> {
        let memory = self.probe.memory_percent();
        if memory <= self.config.memory_threshold {
            return Ok(Vec::new());
        }

        let entries = self.manager.entry_stats();
        let count = eviction_count(
            entries.len(),
            memory,
            self.config.memory_threshold,
            self.config.min_cache_size,
        );
        if count == 0 {
            debug!(memory, cached = entries.len(), "memory pressure but cache at minimum");
            return Ok(Vec::new());
        }

        let dependents = self.manager.store().with_model(self.manager.model(), |meta| {
            meta.reverse_index().clone()
        })?;
        let mut released = Vec::with_capacity(count);
        for shard_id in rank_candidates(&entries, &dependents, self.config.mode) {
            if released.len() == count {
                break;
            }
            if self.manager.unload_shard(&shard_id) {
                released.push(shard_id);
            } else {
                warn!(shard_id = %shard_id, "unload refused under memory pressure");
            }
        }

        info!(
            model = self.manager.model(),
            memory,
            threshold = self.config.memory_threshold,
            mode = %self.config.mode,
            released = released.len(),
            "released shards under memory pressure"
        );
        Ok(released)
    }

    /// Run [`check_and_unload`](Self::check_and_unload) every
    /// `check_interval_ms` on a background worker.
    pub fn start_watcher(self: &Arc<Self>) -> ShardResult<()> {
        let mut watcher = self.watcher.lock();
        if watcher.as_ref().is_some_and(BackgroundWorker::is_running) {
            return Ok(());
        }
        let weak = Arc::downgrade(self);
        *watcher = Some(BackgroundWorker::spawn(
            "shard-unloader",
            Duration::from_millis(self.config.check_interval_ms),
            move || {
                if let Some(strategy) = weak.upgrade() {
                    if let Err(e) = strategy.check_and_unload() {
                        warn!(error = %e, "memory pressure check failed");
                    }
                }
            },
        )?);
        Ok(())
    }

    /// Returns `false` when the watcher had to be detached.
    pub fn stop_watcher(&self) -> bool {
        match self.watcher.lock().take() {
            Some(mut worker) => worker.stop(Duration::from_millis(self.config.stop_timeout_ms)),
            None => true,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .as_ref()
            .is_some_and(BackgroundWorker::is_running)
    }
}
