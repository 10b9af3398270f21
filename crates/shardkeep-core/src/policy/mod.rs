//! Cache admission and eviction policies.
//!
//! Every policy implements [`CachePolicy`] over a bounded key -> payload
//! table. The five algorithms differ only in bookkeeping updates and victim
//! choice, expressed as an [`EvictionRule`] plugged into [`BoundedPolicy`].
//!
//! | Policy | Victim | Tie-break |
//! |--------|--------|-----------|
//! | LRU | least recently used | - |
//! | LFU | lowest access count | oldest last access |
//! | FIFO | oldest insertion (hits never reorder) | - |
//! | Weight-Aware | lowest `weight / (max(size, 0.1) * time_factor)` | oldest last access |
//! | Freq-Aware | cold entries first, lowest count | oldest last access |
//!
//! Admission into a full policy evicts first, so `len() <= capacity()` holds
//! after every operation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ShardError, ShardResult};

mod fifo;
mod freq;
mod lfu;
mod lru;
mod weight;

pub use fifo::Fifo;
pub use freq::FreqAware;
pub use lfu::Lfu;
pub use lru::Lru;
pub use weight::WeightAware;

/// Cache algorithm name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    #[serde(rename = "LRU")]
    Lru,
    #[serde(rename = "LFU")]
    Lfu,
    #[serde(rename = "FIFO")]
    Fifo,
    #[serde(rename = "Weight-Aware", alias = "WEIGHT_AWARE")]
    WeightAware,
    #[serde(rename = "Freq-Aware", alias = "FREQ_AWARE")]
    FreqAware,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 5] = [
        PolicyKind::Lru,
        PolicyKind::Lfu,
        PolicyKind::Fifo,
        PolicyKind::WeightAware,
        PolicyKind::FreqAware,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "LRU",
            Self::Lfu => "LFU",
            Self::Fifo => "FIFO",
            Self::WeightAware => "Weight-Aware",
            Self::FreqAware => "Freq-Aware",
        }
    }

    /// Names of every available strategy.
    pub fn available() -> Vec<&'static str> {
        Self::ALL.iter().map(PolicyKind::as_str).collect()
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "LRU" => Ok(Self::Lru),
            "LFU" => Ok(Self::Lfu),
            "FIFO" => Ok(Self::Fifo),
            "WEIGHT_AWARE" => Ok(Self::WeightAware),
            "FREQ_AWARE" => Ok(Self::FreqAware),
            _ => Err(ShardError::UnknownStrategy {
                name: s.to_string(),
            }),
        }
    }
}

/// Strategy name, capacity and algorithm parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub strategy: PolicyKind,
    pub capacity: usize,
    /// Freq-Aware: access count at which an entry is hot.
    pub hot_threshold: u64,
    /// Freq-Aware: idle seconds after which a non-hot entry is cold.
    pub cold_time_secs: f64,
    /// Weight-Aware: weight for shards without an explicit entry.
    pub default_weight: f64,
    /// Weight-Aware: per-shard weights.
    pub shard_weights: HashMap<String, f64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            strategy: PolicyKind::Lru,
            capacity: 5,
            hot_threshold: freq::DEFAULT_HOT_THRESHOLD,
            cold_time_secs: freq::DEFAULT_COLD_TIME.as_secs_f64(),
            default_weight: 1.0,
            shard_weights: HashMap::new(),
        }
    }
}

impl PolicyConfig {
    pub fn new(strategy: PolicyKind, capacity: usize) -> Self {
        Self {
            strategy,
            capacity,
            ..Self::default()
        }
    }

    pub fn with_hot_threshold(mut self, threshold: u64) -> Self {
        self.hot_threshold = threshold;
        self
    }

    pub fn with_cold_time(mut self, cold_time: Duration) -> Self {
        self.cold_time_secs = cold_time.as_secs_f64();
        self
    }

    pub fn with_weight(mut self, shard_id: impl Into<String>, weight: f64) -> Self {
        self.shard_weights.insert(shard_id.into(), weight);
        self
    }

    pub fn cold_time(&self) -> Duration {
        Duration::from_secs_f64(self.cold_time_secs.max(0.0))
    }

    /// Weight assigned to a shard at admission.
    pub fn weight_for(&self, shard_id: &str) -> f64 {
        self.shard_weights
            .get(shard_id)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.capacity == 0 {
            return Err(ShardError::Config {
                message: "cache capacity must be at least 1".to_string(),
            });
        }
        if !self.cold_time_secs.is_finite() || self.cold_time_secs < 0.0 {
            return Err(ShardError::Config {
                message: format!("invalid cold time: {}", self.cold_time_secs),
            });
        }
        Ok(())
    }
}

/// Per-entry parameters supplied at admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmitOptions {
    /// Relative footprint (MiB for shards).
    pub size: f64,
    pub weight: f64,
}

impl Default for AdmitOptions {
    fn default() -> Self {
        Self {
            size: 1.0,
            weight: 1.0,
        }
    }
}

/// Bookkeeping for one cached entry.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub size: f64,
    pub weight: f64,
    pub(crate) insert_seq: u64,
    pub(crate) access_seq: u64,
}

/// Snapshot of one entry's bookkeeping.
#[derive(Debug, Clone)]
pub struct EntryStats {
    pub key: String,
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub size: f64,
    pub weight: f64,
}

struct CacheEntry<V> {
    value: V,
    meta: EntryMeta,
}

/// Entry drained from a policy during a hot switch.
#[derive(Debug, Clone)]
pub struct DrainedEntry<V> {
    pub key: String,
    pub value: V,
    pub options: AdmitOptions,
}

/// Common contract of every cache algorithm.
pub trait CachePolicy<V>: Send + Sync {
    fn kind(&self) -> PolicyKind;

    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace `key`, evicting first when full. Returns evicted keys.
    fn admit(&mut self, key: &str, value: V, opts: AdmitOptions) -> Vec<String>;

    /// Look up `key`, refreshing its recency/frequency per the algorithm.
    fn get(&mut self, key: &str) -> Option<V>;

    fn remove(&mut self, key: &str) -> bool;

    /// Evict one entry chosen by the algorithm.
    fn evict(&mut self) -> Option<String>;

    fn contains(&self, key: &str) -> bool;

    fn clear(&mut self);

    fn keys(&self) -> Vec<String>;

    /// Change capacity, evicting down to it immediately. Returns evicted keys.
    fn resize(&mut self, capacity: usize) -> Vec<String>;

    fn stats(&self) -> Vec<EntryStats>;

    /// Remove every entry, least recently accessed first.
    fn drain(&mut self) -> Vec<DrainedEntry<V>>;
}

/// Bookkeeping updates and victim choice for one algorithm.
pub trait EvictionRule: Send + Sync + 'static {
    fn kind(&self) -> PolicyKind;

    /// Called after an entry is written. `existed` is true on replacement.
    fn on_admit(&mut self, key: &str, meta: &mut EntryMeta, existed: bool);

    fn on_hit(&mut self, key: &str, meta: &mut EntryMeta);

    fn on_remove(&mut self, _key: &str, _meta: &EntryMeta) {}

    fn on_clear(&mut self) {}

    fn victim<'a, I>(&self, entries: I, now: Instant) -> Option<&'a str>
    where
        I: Iterator<Item = (&'a str, &'a EntryMeta)>;
}

/// Bounded key -> payload table driven by an [`EvictionRule`].
pub struct BoundedPolicy<V, R> {
    capacity: usize,
    entries: HashMap<String, CacheEntry<V>>,
    rule: R,
    seq: u64,
    clock: Arc<dyn Clock>,
}

pub type LruPolicy<V> = BoundedPolicy<V, Lru>;
pub type LfuPolicy<V> = BoundedPolicy<V, Lfu>;
pub type FifoPolicy<V> = BoundedPolicy<V, Fifo>;
pub type WeightAwarePolicy<V> = BoundedPolicy<V, WeightAware>;
pub type FreqAwarePolicy<V> = BoundedPolicy<V, FreqAware>;

impl<V, R: EvictionRule> BoundedPolicy<V, R> {
    /// Capacity below 1 is raised to 1.
    pub fn with_rule(capacity: usize, rule: R, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            rule,
            seq: 0,
            clock,
        }
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn select_victim(&self) -> Option<String> {
        let now = self.clock.now();
        self.rule
            .victim(
                self.entries.iter().map(|(k, e)| (k.as_str(), &e.meta)),
                now,
            )
            .map(str::to_string)
    }
}

impl<V, R: EvictionRule + Default> BoundedPolicy<V, R> {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self::with_rule(capacity, R::default(), clock)
    }
}

impl<V, R> CachePolicy<V> for BoundedPolicy<V, R>
where
    V: Clone + Send + Sync,
    R: EvictionRule,
{
    fn kind(&self) -> PolicyKind {
        self.rule.kind()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn admit(&mut self, key: &str, value: V, opts: AdmitOptions) -> Vec<String> {
        let mut evicted = Vec::new();
        if !self.entries.contains_key(key) {
            while self.entries.len() >= self.capacity {
                match self.evict() {
                    Some(k) => evicted.push(k),
                    None => break,
                }
            }
        }

        let now = self.clock.now();
        let seq = self.next_seq();
        let existed = self.entries.contains_key(key);
        let entry = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.value = value;
                entry
            }
            Entry::Vacant(vacant) => vacant.insert(CacheEntry {
                value,
                meta: EntryMeta {
                    inserted_at: now,
                    last_access: now,
                    access_count: 0,
                    size: opts.size,
                    weight: opts.weight,
                    insert_seq: seq,
                    access_seq: seq,
                },
            }),
        };
        entry.meta.last_access = now;
        entry.meta.access_seq = seq;
        entry.meta.size = opts.size;
        entry.meta.weight = opts.weight;
        self.rule.on_admit(key, &mut entry.meta, existed);
        evicted
    }

    fn get(&mut self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let seq = self.seq + 1;
        let entry = self.entries.get_mut(key)?;
        self.seq = seq;
        entry.meta.last_access = now;
        entry.meta.access_seq = seq;
        self.rule.on_hit(key, &mut entry.meta);
        Some(entry.value.clone())
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.rule.on_remove(key, &entry.meta);
                true
            }
            None => false,
        }
    }

    fn evict(&mut self) -> Option<String> {
        let victim = self.select_victim()?;
        self.remove(&victim);
        Some(victim)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn clear(&mut self) {
        for (key, entry) in &self.entries {
            self.rule.on_remove(key, &entry.meta);
        }
        self.entries.clear();
        self.rule.on_clear();
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<(&String, u64)> = self
            .entries
            .iter()
            .map(|(k, e)| (k, e.meta.insert_seq))
            .collect();
        keys.sort_by_key(|(_, seq)| *seq);
        keys.into_iter().map(|(k, _)| k.clone()).collect()
    }

    fn resize(&mut self, capacity: usize) -> Vec<String> {
        self.capacity = capacity.max(1);
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.evict() {
                Some(k) => evicted.push(k),
                None => break,
            }
        }
        evicted
    }

    fn stats(&self) -> Vec<EntryStats> {
        self.entries
            .iter()
            .map(|(k, e)| EntryStats {
                key: k.clone(),
                inserted_at: e.meta.inserted_at,
                last_access: e.meta.last_access,
                access_count: e.meta.access_count,
                size: e.meta.size,
                weight: e.meta.weight,
            })
            .collect()
    }

    fn drain(&mut self) -> Vec<DrainedEntry<V>> {
        let mut entries: Vec<(String, CacheEntry<V>)> = self.entries.drain().collect();
        entries.sort_by_key(|(_, e)| e.meta.access_seq);
        for (key, entry) in &entries {
            self.rule.on_remove(key, &entry.meta);
        }
        self.rule.on_clear();
        entries
            .into_iter()
            .map(|(key, entry)| DrainedEntry {
                key,
                options: AdmitOptions {
                    size: entry.meta.size,
                    weight: entry.meta.weight,
                },
                value: entry.value,
            })
            .collect()
    }
}

/// Instantiate the policy described by `config`.
pub fn create_policy<V>(config: &PolicyConfig, clock: Arc<dyn Clock>) -> Box<dyn CachePolicy<V>>
where
    V: Clone + Send + Sync + 'static,
{
    let capacity = config.capacity;
    match config.strategy {
        PolicyKind::Lru => Box::new(LruPolicy::new(capacity, clock)),
        PolicyKind::Lfu => Box::new(LfuPolicy::new(capacity, clock)),
        PolicyKind::Fifo => Box::new(FifoPolicy::new(capacity, clock)),
        PolicyKind::WeightAware => Box::new(WeightAwarePolicy::new(capacity, clock)),
        PolicyKind::FreqAware => Box::new(FreqAwarePolicy::with_rule(
            capacity,
            FreqAware::new(config.hot_threshold, config.cold_time()),
            clock,
        )),
    }
}

/// Least recently accessed entry. Shared tie-break for every rule.
pub(crate) fn oldest_access<'a, I>(entries: I) -> Option<&'a str>
where
    I: Iterator<Item = (&'a str, &'a EntryMeta)>,
{
    entries
        .min_by_key(|(_, meta)| meta.access_seq)
        .map(|(k, _)| k)
}
