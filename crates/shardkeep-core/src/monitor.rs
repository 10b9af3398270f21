//! Shard load monitoring.
//!
//! [`ShardMonitor`] is installed as the outermost [`LoadInterceptor`], so the
//! durations it records include any recovery work done further down the
//! chain. It tracks per-shard load durations, failures, loads made on behalf
//! of a dependent, and reload intervals, and derives hot/slow shard reports
//! and optimisation suggestions from them.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{system_clock, Clock};
use crate::error::ShardResult;
use crate::io::write_json_atomic;
use crate::pipeline::{InterceptorStage, LoadInterceptor, LoadNext, UnloadNext};

/// Records between automatic snapshot writes.
const SNAPSHOT_EVERY: usize = 50;
const CONCURRENCY_WARNING: usize = 3;
const REPEAT_LOADS_WARNING: usize = 5;
const SHORT_INTERVAL: Duration = Duration::from_secs(60);

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Minimum load count for a shard to count as hot.
    pub hot_threshold: usize,
    /// Bounded event history length.
    pub history_size: usize,
    /// JSON snapshot written periodically and by `save_snapshot`.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 5,
            history_size: 1000,
            snapshot_path: None,
        }
    }
}

impl MonitorConfig {
    pub fn with_hot_threshold(mut self, threshold: usize) -> Self {
        self.hot_threshold = threshold;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Success,
    Failed,
    CacheHit,
    FromCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadAction {
    Load,
    Unload,
}

/// One entry of the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadEvent {
    pub shard_id: String,
    pub action: LoadAction,
    pub timestamp: DateTime<Utc>,
    pub status: Option<LoadStatus>,
    pub duration_secs: Option<f64>,
    /// Seconds since the shard's previous load.
    pub interval_secs: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct ShardLoads {
    durations: Vec<Duration>,
    intervals: Vec<Duration>,
    failures: u64,
    last_load: Option<Instant>,
}

#[derive(Debug, Default)]
struct MonitorState {
    loads: HashMap<String, ShardLoads>,
    dependency_loads: HashMap<String, u64>,
    history: VecDeque<LoadEvent>,
    in_flight: HashSet<String>,
    max_concurrent: usize,
    records: usize,
}

/// Load statistics of one shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadingPattern {
    pub shard_id: String,
    pub load_count: usize,
    pub failed_loads: u64,
    pub as_dependency_count: u64,
    pub total_load_time: f64,
    pub avg_load_time: f64,
    pub median_load_time: f64,
    pub min_load_time: f64,
    pub max_load_time: f64,
    pub std_dev: f64,
    pub repeat_loads: usize,
    pub avg_interval: f64,
}

/// Aggregate monitor counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStats {
    pub total_loads: usize,
    pub total_load_time: f64,
    pub unique_shards: usize,
    pub failed_loads: u64,
    pub fail_rate: f64,
    pub max_concurrent_loads: usize,
    pub dependency_only_shards: usize,
    pub history_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Preload,
    Merge,
    OptimizeSlow,
    FixFailures,
    ReduceConcurrency,
    GrowCache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub shards: Vec<String>,
    pub message: String,
}

/// Periodic JSON snapshot for external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub stats: MonitorStats,
    pub failed_loads: BTreeMap<String, u64>,
    pub dependency_loads: BTreeMap<String, u64>,
    pub hot_shards: Vec<(String, usize)>,
    pub slow_shards: Vec<(String, f64)>,
    pub suggestions: Vec<Suggestion>,
}

/// Observes loads and unloads passing through the pipeline.
#[derive(Debug)]
pub struct ShardMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Sample standard deviation.
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn secs(durations: &[Duration]) -> Vec<f64> {
    durations.iter().map(Duration::as_secs_f64).collect()
}

impl ShardMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn push_event(&self, state: &mut MonitorState, event: LoadEvent) {
        if state.history.len() >= self.config.history_size.max(1) {
            state.history.pop_front();
        }
        state.history.push_back(event);
        state.records += 1;
    }

    /// Record a completed load attempt.
    pub fn record_load(
        &self,
        shard_id: &str,
        duration: Duration,
        status: LoadStatus,
        error: Option<String>,
    ) {
        let now = self.clock.now();
        let save_due = {
            let mut state = self.state.lock();
            let loads = state.loads.entry(shard_id.to_string()).or_default();
            loads.durations.push(duration);
            let interval = loads.last_load.map(|prev| now.saturating_duration_since(prev));
            if let Some(interval) = interval {
                loads.intervals.push(interval);
            }
            loads.last_load = Some(now);
            if status == LoadStatus::Failed {
                loads.failures += 1;
            }

            let event = LoadEvent {
                shard_id: shard_id.to_string(),
                action: LoadAction::Load,
                timestamp: Utc::now(),
                status: Some(status),
                duration_secs: Some(duration.as_secs_f64()),
                interval_secs: interval.map(|i| i.as_secs_f64()),
                error,
            };
            self.push_event(&mut state, event);
            self.config.snapshot_path.is_some() && state.records % SNAPSHOT_EVERY == 0
        };

        if save_due {
            if let Err(e) = self.save_snapshot() {
                warn!(error = %e, "failed to save monitor snapshot");
            }
        }
    }

    pub fn record_unload(&self, shard_id: &str) {
        let mut state = self.state.lock();
        let event = LoadEvent {
            shard_id: shard_id.to_string(),
            action: LoadAction::Unload,
            timestamp: Utc::now(),
            status: None,
            duration_secs: None,
            interval_secs: None,
            error: None,
        };
        self.push_event(&mut state, event);
    }

    /// Count a load made on behalf of a dependent shard.
    pub fn record_dependency_load(&self, shard_id: &str) {
        *self
            .state
            .lock()
            .dependency_loads
            .entry(shard_id.to_string())
            .or_default() += 1;
    }

    /// Shards loaded at least `hot_threshold` times, most loaded first.
    pub fn hot_shards(&self, limit: usize) -> Vec<(String, usize)> {
        let state = self.state.lock();
        let mut hot: Vec<(String, usize)> = state
            .loads
            .iter()
            .map(|(id, loads)| (id.clone(), loads.durations.len()))
            .filter(|(_, count)| *count >= self.config.hot_threshold)
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hot.truncate(limit);
        hot
    }

    /// Shards with the highest mean load time, in seconds.
    pub fn slow_shards(&self, limit: usize) -> Vec<(String, f64)> {
        let state = self.state.lock();
        let mut slow: Vec<(String, f64)> = state
            .loads
            .iter()
            .filter(|(_, loads)| !loads.durations.is_empty())
            .map(|(id, loads)| (id.clone(), mean(&secs(&loads.durations))))
            .collect();
        slow.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        slow.truncate(limit);
        slow
    }

    pub fn loading_pattern(&self, shard_id: &str) -> Option<LoadingPattern> {
        let state = self.state.lock();
        let loads = state.loads.get(shard_id)?;
        let times = secs(&loads.durations);
        let intervals = secs(&loads.intervals);
        Some(LoadingPattern {
            shard_id: shard_id.to_string(),
            load_count: times.len(),
            failed_loads: loads.failures,
            as_dependency_count: state.dependency_loads.get(shard_id).copied().unwrap_or(0),
            total_load_time: times.iter().sum(),
            avg_load_time: mean(&times),
            median_load_time: median(&times),
            min_load_time: times.iter().copied().reduce(f64::min).unwrap_or(0.0),
            max_load_time: times.iter().copied().reduce(f64::max).unwrap_or(0.0),
            std_dev: std_dev(&times),
            repeat_loads: intervals.len(),
            avg_interval: mean(&intervals),
        })
    }

    pub fn stats(&self) -> MonitorStats {
        let state = self.state.lock();
        let total_loads: usize = state.loads.values().map(|l| l.durations.len()).sum();
        let total_load_time: f64 = state
            .loads
            .values()
            .flat_map(|l| l.durations.iter())
            .map(Duration::as_secs_f64)
            .sum();
        let failed_loads: u64 = state.loads.values().map(|l| l.failures).sum();
        let dependency_only_shards = state
            .dependency_loads
            .keys()
            .filter(|id| !state.loads.contains_key(*id))
            .count();
        MonitorStats {
            total_loads,
            total_load_time,
            unique_shards: state.loads.len(),
            failed_loads,
            fail_rate: if total_loads == 0 {
                0.0
            } else {
                failed_loads as f64 / total_loads as f64
            },
            max_concurrent_loads: state.max_concurrent,
            dependency_only_shards,
            history_size: state.history.len(),
        }
    }

    pub fn history(&self) -> Vec<LoadEvent> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Rule-based optimisation hints derived from the recorded loads.
    pub fn suggestions(&self) -> Vec<Suggestion> {
        let mut out = Vec::new();

        let hot = self.hot_shards(10);
        if !hot.is_empty() {
            let ids: Vec<String> = hot.iter().take(3).map(|(id, _)| id.clone()).collect();
            out.push(Suggestion {
                kind: SuggestionKind::Preload,
                message: format!("consider preloading hot shards: {}", ids.join(", ")),
                shards: ids,
            });

            let dependency_loads = self.state.lock().dependency_loads.clone();
            for (id, count) in &hot {
                let as_dep = dependency_loads.get(id).copied().unwrap_or(0);
                if as_dep as f64 > *count as f64 / 2.0 {
                    out.push(Suggestion {
                        kind: SuggestionKind::Merge,
                        shards: vec![id.clone()],
                        message: format!(
                            "shard {} is mostly loaded as a dependency; consider merging it with its dependents",
                            id
                        ),
                    });
                }
            }
        }

        let slow = self.slow_shards(5);
        if !slow.is_empty() {
            let listed: Vec<String> = slow
                .iter()
                .take(3)
                .map(|(id, t)| format!("{} ({:.4}s)", id, t))
                .collect();
            out.push(Suggestion {
                kind: SuggestionKind::OptimizeSlow,
                shards: slow.iter().take(3).map(|(id, _)| id.clone()).collect(),
                message: format!("optimise slow loading shards: {}", listed.join(", ")),
            });
        }

        let (mut failing, max_concurrent, ids) = {
            let state = self.state.lock();
            let failing: Vec<(String, u64)> = state
                .loads
                .iter()
                .filter(|(_, l)| l.failures > 0)
                .map(|(id, l)| (id.clone(), l.failures))
                .collect();
            let mut ids: Vec<String> = state.loads.keys().cloned().collect();
            ids.sort();
            (failing, state.max_concurrent, ids)
        };
        if !failing.is_empty() {
            failing.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            failing.truncate(3);
            let listed: Vec<String> = failing
                .iter()
                .map(|(id, n)| format!("{} ({} failures)", id, n))
                .collect();
            out.push(Suggestion {
                kind: SuggestionKind::FixFailures,
                shards: failing.into_iter().map(|(id, _)| id).collect(),
                message: format!("fix failing shards: {}", listed.join(", ")),
            });
        }

        if max_concurrent > CONCURRENCY_WARNING {
            out.push(Suggestion {
                kind: SuggestionKind::ReduceConcurrency,
                shards: Vec::new(),
                message: format!(
                    "{} shards loaded concurrently; consider ordering loads to reduce memory pressure",
                    max_concurrent
                ),
            });
        }

        let repeated: Vec<String> = ids
            .into_iter()
            .filter(|id| {
                self.loading_pattern(id).is_some_and(|p| {
                    p.repeat_loads > REPEAT_LOADS_WARNING
                        && p.avg_interval < SHORT_INTERVAL.as_secs_f64()
                })
            })
            .collect();
        if !repeated.is_empty() {
            let shown: Vec<String> = repeated.iter().take(3).cloned().collect();
            out.push(Suggestion {
                kind: SuggestionKind::GrowCache,
                message: format!(
                    "shards {} are reloaded at short intervals; consider a larger cache or a different unload strategy",
                    shown.join(", ")
                ),
                shards: shown,
            });
        }

        out
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let (failed_loads, dependency_loads) = {
            let state = self.state.lock();
            let failed: BTreeMap<String, u64> = state
                .loads
                .iter()
                .filter(|(_, l)| l.failures > 0)
                .map(|(id, l)| (id.clone(), l.failures))
                .collect();
            let deps: BTreeMap<String, u64> = state
                .dependency_loads
                .iter()
                .map(|(id, n)| (id.clone(), *n))
                .collect();
            (failed, deps)
        };
        MonitorSnapshot {
            timestamp: Utc::now(),
            stats: self.stats(),
            failed_loads,
            dependency_loads,
            hot_shards: self.hot_shards(10),
            slow_shards: self.slow_shards(10),
            suggestions: self.suggestions(),
        }
    }

    /// Write the snapshot to the configured path. No-op without a path.
    pub fn save_snapshot(&self) -> ShardResult<()> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        write_json_atomic(path, &self.snapshot())?;
        debug!(path = %path.display(), "saved monitor snapshot");
        Ok(())
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.loads.clear();
        state.dependency_loads.clear();
        state.history.clear();
        state.records = 0;
    }

    fn begin_load(&self, shard_id: &str) {
        let mut state = self.state.lock();
        state.in_flight.insert(shard_id.to_string());
        state.max_concurrent = state.max_concurrent.max(state.in_flight.len());
    }

    fn end_load(&self, shard_id: &str) {
        self.state.lock().in_flight.remove(shard_id);
    }
}

impl<V> LoadInterceptor<V> for ShardMonitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn stage(&self) -> InterceptorStage {
        InterceptorStage::Observe
    }

    fn around_load(&self, shard_id: &str, next: LoadNext<'_, V>) -> ShardResult<Option<V>> {
        self.begin_load(shard_id);
        let started = Instant::now();
        let result = next(shard_id);
        let elapsed = started.elapsed();
        self.end_load(shard_id);

        match &result {
            Ok(Some(_)) => self.record_load(shard_id, elapsed, LoadStatus::Success, None),
            Ok(None) => self.record_load(shard_id, elapsed, LoadStatus::Failed, None),
            Err(e) => self.record_load(shard_id, elapsed, LoadStatus::Failed, Some(e.to_string())),
        }
        result
    }

    fn around_unload(&self, shard_id: &str, next: UnloadNext<'_>) -> bool {
        let released = next(shard_id);
        if released {
            self.record_unload(shard_id);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ShardError;
    use tempfile::TempDir;

    fn create_test_monitor(hot_threshold: usize) -> (ShardMonitor, ManualClock) {
        let clock = ManualClock::new();
        let monitor = ShardMonitor::with_clock(
            MonitorConfig::default().with_hot_threshold(hot_threshold),
            Arc::new(clock.clone()),
        );
        (monitor, clock)
    }

    fn ok_load(monitor: &ShardMonitor, id: &str) {
        let out = LoadInterceptor::<u32>::around_load(monitor, id, &|_: &str| Ok(Some(1)));
        assert!(out.is_ok());
    }

    // ==================== Recording ====================

    #[test]
    fn test_records_success_and_failure() {
        let (monitor, _clock) = create_test_monitor(2);
        ok_load(&monitor, "s1");
        let err = LoadInterceptor::<u32>::around_load(&monitor, "s2", &|id: &str| {
            Err(ShardError::LoadFailed {
                shard_id: id.to_string(),
                reason: "disk".into(),
            })
        });
        assert!(err.is_err());
        let none = LoadInterceptor::<u32>::around_load(&monitor, "s2", &|_: &str| Ok(None));
        assert_eq!(none.unwrap(), None);

        let stats = monitor.stats();
        assert_eq!(stats.total_loads, 3);
        assert_eq!(stats.failed_loads, 2);
        assert_eq!(stats.unique_shards, 2);
        assert!((stats.fail_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.max_concurrent_loads, 1);

        let history = monitor.history();
        assert_eq!(history[1].error.as_deref(), Some("failed to load s2: disk"));
    }

    #[test]
    fn test_unload_recorded_only_when_released() {
        let (monitor, _clock) = create_test_monitor(2);
        assert!(LoadInterceptor::<u32>::around_unload(&monitor, "s1", &|_: &str| true));
        assert!(!LoadInterceptor::<u32>::around_unload(&monitor, "s2", &|_: &str| false));
        let history = monitor.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, LoadAction::Unload);
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = ShardMonitor::new(MonitorConfig {
            history_size: 3,
            ..MonitorConfig::default()
        });
        for i in 0..5 {
            ok_load(&monitor, &format!("s{}", i));
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].shard_id, "s2");
    }

    // ==================== Reports ====================

    #[test]
    fn test_hot_and_slow_shards() {
        let (monitor, _clock) = create_test_monitor(2);
        for _ in 0..3 {
            monitor.record_load("a", Duration::from_millis(10), LoadStatus::Success, None);
        }
        monitor.record_load("b", Duration::from_millis(500), LoadStatus::Success, None);
        monitor.record_load("b", Duration::from_millis(300), LoadStatus::Success, None);
        monitor.record_load("c", Duration::from_millis(50), LoadStatus::Success, None);

        assert_eq!(
            monitor.hot_shards(5),
            vec![("a".to_string(), 3), ("b".to_string(), 2)]
        );
        let slow = monitor.slow_shards(1);
        assert_eq!(slow[0].0, "b");
        assert!((slow[0].1 - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_loading_pattern() {
        let (monitor, clock) = create_test_monitor(2);
        for ms in [100, 200, 600] {
            monitor.record_load("s1", Duration::from_millis(ms), LoadStatus::Success, None);
            clock.advance(Duration::from_secs(10));
        }
        monitor.record_dependency_load("s1");

        let p = monitor.loading_pattern("s1").unwrap();
        assert_eq!(p.load_count, 3);
        assert_eq!(p.as_dependency_count, 1);
        assert!((p.avg_load_time - 0.3).abs() < 1e-9);
        assert!((p.median_load_time - 0.2).abs() < 1e-9);
        assert!((p.min_load_time - 0.1).abs() < 1e-9);
        assert!((p.max_load_time - 0.6).abs() < 1e-9);
        assert_eq!(p.repeat_loads, 2);
        assert!((p.avg_interval - 10.0).abs() < 1e-9);
        assert!(monitor.loading_pattern("unknown").is_none());
    }

    #[test]
    fn test_suggestions() {
        let (monitor, clock) = create_test_monitor(3);
        for _ in 0..7 {
            monitor.record_load("s1", Duration::from_millis(5), LoadStatus::Success, None);
            monitor.record_dependency_load("s1");
            clock.advance(Duration::from_secs(1));
        }
        monitor.record_load("s2", Duration::from_millis(5), LoadStatus::Failed, Some("io".into()));

        let kinds: Vec<SuggestionKind> = monitor.suggestions().iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&SuggestionKind::Preload));
        assert!(kinds.contains(&SuggestionKind::Merge));
        assert!(kinds.contains(&SuggestionKind::OptimizeSlow));
        assert!(kinds.contains(&SuggestionKind::FixFailures));
        assert!(kinds.contains(&SuggestionKind::GrowCache));
        assert!(!kinds.contains(&SuggestionKind::ReduceConcurrency));
    }

    #[test]
    fn test_dependency_only_shards_and_clear() {
        let (monitor, _clock) = create_test_monitor(2);
        monitor.record_dependency_load("base");
        ok_load(&monitor, "top");
        assert_eq!(monitor.stats().dependency_only_shards, 1);

        monitor.clear_history();
        let stats = monitor.stats();
        assert_eq!(stats.total_loads, 0);
        assert_eq!(stats.history_size, 0);
    }

    #[test]
    fn test_snapshot_written_every_fifty_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("monitor.json");
        let monitor = ShardMonitor::new(MonitorConfig::default().with_snapshot_path(&path));

        for _ in 0..49 {
            ok_load(&monitor, "s1");
        }
        assert!(!path.exists());
        ok_load(&monitor, "s1");
        assert!(path.exists());

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["stats"]["total_loads"], 50);
        assert_eq!(saved["hot_shards"][0][0], "s1");
    }
}
