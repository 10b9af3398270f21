use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::{BoundedPolicy, EntryMeta, EvictionRule, PolicyKind};

pub(crate) const DEFAULT_HOT_THRESHOLD: u64 = 10;
pub(crate) const DEFAULT_COLD_TIME: Duration = Duration::from_secs(300);
/// Departed keys whose counts are remembered; the oldest departure is
/// forgotten first.
pub(crate) const MAX_RETAINED_COUNTS: usize = 1024;

/// Frequency-aware eviction that prefers cold entries.
///
/// An entry is cold when it has been idle longer than `cold_time` and its
/// access count is below `hot_threshold`. The lowest-count cold entry is
/// evicted first; without cold entries the global lowest count goes.
/// Access counts survive removal, so a re-admitted shard resumes its count.
/// Only counts of keys no longer cached are held here, at most
/// `MAX_RETAINED_COUNTS` of them.
#[derive(Debug, Clone)]
pub struct FreqAware {
    hot_threshold: u64,
    cold_time: Duration,
    retained: HashMap<String, u64>,
    departures: VecDeque<String>,
}

impl FreqAware {
    pub fn new(hot_threshold: u64, cold_time: Duration) -> Self {
        Self {
            hot_threshold,
            cold_time,
            retained: HashMap::new(),
            departures: VecDeque::new(),
        }
    }

    /// Counts remembered for keys that left the cache.
    pub fn retained_counts(&self) -> usize {
        self.retained.len()
    }

    fn forget_oldest(&mut self) {
        while self.retained.len() > MAX_RETAINED_COUNTS {
            match self.departures.pop_front() {
                Some(key) => {
                    self.retained.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn hot_threshold(&self) -> u64 {
        self.hot_threshold
    }

    pub fn cold_time(&self) -> Duration {
        self.cold_time
    }

    fn is_cold(&self, meta: &EntryMeta, now: Instant) -> bool {
        now.saturating_duration_since(meta.last_access) > self.cold_time
            && meta.access_count < self.hot_threshold
    }
}

impl Default for FreqAware {
    fn default() -> Self {
        Self::new(DEFAULT_HOT_THRESHOLD, DEFAULT_COLD_TIME)
    }
}

impl EvictionRule for FreqAware {
    fn kind(&self) -> PolicyKind {
        PolicyKind::FreqAware
    }

    fn on_admit(&mut self, key: &str, meta: &mut EntryMeta, existed: bool) {
        let prior = if existed {
            meta.access_count
        } else {
            match self.retained.remove(key) {
                Some(count) => {
                    self.departures.retain(|k| k != key);
                    count
                }
                None => 0,
            }
        };
        meta.access_count = prior + 1;
    }

    fn on_hit(&mut self, _key: &str, meta: &mut EntryMeta) {
        meta.access_count += 1;
    }

    fn on_remove(&mut self, key: &str, meta: &EntryMeta) {
        if self.retained.insert(key.to_string(), meta.access_count).is_none() {
            self.departures.push_back(key.to_string());
        }
        self.forget_oldest();
    }

    fn victim<'a, I>(&self, entries: I, now: Instant) -> Option<&'a str>
    where
        I: Iterator<Item = (&'a str, &'a EntryMeta)>,
    {
        let all: Vec<(&'a str, &'a EntryMeta)> = entries.collect();
        let rank = |(_, meta): &&(&'a str, &'a EntryMeta)| (meta.access_count, meta.access_seq);

        all.iter()
            .filter(|(_, meta)| self.is_cold(meta, now))
            .min_by_key(rank)
            .or_else(|| all.iter().min_by_key(rank))
            .map(|(k, _)| *k)
    }
}

impl<V> BoundedPolicy<V, FreqAware> {
    /// Cached keys whose access count reached the hot threshold.
    pub fn hot_keys(&self) -> Vec<String> {
        let mut hot: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.meta.access_count >= self.rule.hot_threshold)
            .map(|(k, _)| k.clone())
            .collect();
        hot.sort();
        hot
    }
}
