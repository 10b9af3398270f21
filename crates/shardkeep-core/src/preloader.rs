//! Predictive background preloading.
//!
//! The [`Preloader`] learns from explicitly requested shards (it registers as
//! an [`AccessListener`] on its manager) and speculatively loads the shards it
//! expects next on a [`BackgroundWorker`].
//!
//! ```text
//! Idle ──start──▶ Running ◀──resume/pause──▶ Paused
//!                    │                          │
//!                    └──────────stop────────────┴──▶ Stopped ──start──▶ Running
//! ```
//!
//! Each worker tick refills the queue from [`Preloader::predict_next_shard`]
//! when it is empty, checks the CPU and memory gates, then loads at most one
//! candidate through the manager's normal admission path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ShardError, ShardResult};
use crate::io::write_json_atomic;
use crate::manager::{AccessListener, ShardManager};
use crate::source::ShardPayload;
use crate::telemetry::{system_probe, ResourceProbe};
use crate::worker::BackgroundWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloaderState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for PreloaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        })
    }
}

/// How the next shards are predicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStrategy {
    /// Most frequent observed successor, else the next numbered shard id.
    Sequential,
    /// Shards that depend on the current one.
    Dependency,
    /// Globally most accessed shards.
    Frequency,
    /// Sequential, then dependency, then frequency, de-duplicated.
    #[default]
    Hybrid,
}

impl FromStr for PreloadStrategy {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "dependency" => Ok(Self::Dependency),
            "frequency" => Ok(Self::Frequency),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(ShardError::Config {
                message: format!("unknown preload strategy: {}", other),
            }),
        }
    }
}

/// Preloader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloaderConfig {
    pub strategy: PreloadStrategy,
    /// Preloading pauses at or above this CPU percentage.
    pub max_cpu_percent: f32,
    /// Preloading pauses at or above this memory (and GPU memory) percentage.
    pub max_memory_percent: f32,
    /// Concurrent preloads, also the number of frequency predictions.
    pub max_preload_shards: usize,
    pub check_interval_ms: u64,
    pub stop_timeout_ms: u64,
    /// Accesses kept in the bounded history.
    pub history_size: usize,
    /// JSON file the access history is persisted to.
    pub history_path: Option<PathBuf>,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            strategy: PreloadStrategy::Hybrid,
            max_cpu_percent: 30.0,
            max_memory_percent: 75.0,
            max_preload_shards: 3,
            check_interval_ms: 2000,
            stop_timeout_ms: 5000,
            history_size: 100,
            history_path: None,
        }
    }
}

impl PreloaderConfig {
    pub fn with_strategy(mut self, strategy: PreloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_path = Some(path.into());
        self
    }

    pub fn with_limits(mut self, max_cpu_percent: f32, max_memory_percent: f32) -> Self {
        self.max_cpu_percent = max_cpu_percent;
        self.max_memory_percent = max_memory_percent;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub shard_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub count: u64,
}

/// Persisted access history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AccessHistory {
    frequency: HashMap<String, u64>,
    /// Sorted by count, highest first.
    transitions: Vec<Transition>,
    history: VecDeque<AccessEntry>,
}

impl AccessHistory {
    fn record(&mut self, shard_id: &str, limit: usize) {
        let previous = self.history.back().map(|e| e.shard_id.clone());
        self.history.push_back(AccessEntry {
            shard_id: shard_id.to_string(),
            timestamp: Utc::now(),
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
        *self.frequency.entry(shard_id.to_string()).or_insert(0) += 1;

        if let Some(from) = previous {
            match self
                .transitions
                .iter_mut()
                .find(|t| t.from == from && t.to == shard_id)
            {
                Some(t) => t.count += 1,
                None => self.transitions.push(Transition {
                    from,
                    to: shard_id.to_string(),
                    count: 1,
                }),
            }
            self.transitions.sort_by(|a, b| b.count.cmp(&a.count));
        }
    }

    fn current(&self) -> Option<&str> {
        self.history.back().map(|e| e.shard_id.as_str())
    }
}

/// Next id in a numbered sequence, keeping zero padding.
pub fn next_in_sequence(shard_id: &str) -> Option<String> {
    let digits = shard_id
        .bytes()
        .rev()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    let (prefix, number) = shard_id.split_at(shard_id.len() - digits);
    let next = number.parse::<u64>().ok()?.checked_add(1)?;
    Some(format!("{}{:0width$}", prefix, next, width = digits))
}

/// Snapshot returned by [`Preloader::preload_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadStats {
    pub state: PreloaderState,
    pub strategy: PreloadStrategy,
    pub preloading: Vec<String>,
    pub preloaded: Vec<String>,
    pub queue_size: usize,
    pub history_size: usize,
    pub unique_shards: usize,
    pub transitions: usize,
}

/// Background predictive prefetcher for one [`ShardManager`].
pub struct Preloader<V: ShardPayload> {
    manager: Arc<ShardManager<V>>,
    probe: Arc<dyn ResourceProbe>,
    config: PreloaderConfig,
    state: Mutex<PreloaderState>,
    history: Mutex<AccessHistory>,
    queue: Mutex<VecDeque<String>>,
    preloading: Mutex<HashSet<String>>,
    preloaded: Mutex<HashSet<String>>,
    worker: Mutex<Option<BackgroundWorker>>,
}

impl<V: ShardPayload> Preloader<V> {
    pub fn new(manager: Arc<ShardManager<V>>, config: PreloaderConfig) -> Arc<Self> {
        Self::with_probe(manager, config, system_probe())
    }

    /// Create a preloader and register it for the manager's access events.
    /// Persisted history is loaded when `history_path` exists.
    pub fn with_probe(
        manager: Arc<ShardManager<V>>,
        config: PreloaderConfig,
        probe: Arc<dyn ResourceProbe>,
    ) -> Arc<Self> {
        let history = config
            .history_path
            .as_ref()
            .map(|path| load_history(path, config.history_size))
            .unwrap_or_default();

        let preloader = Arc::new(Self {
            manager,
            probe,
            config,
            state: Mutex::new(PreloaderState::Idle),
            history: Mutex::new(history),
            queue: Mutex::new(VecDeque::new()),
            preloading: Mutex::new(HashSet::new()),
            preloaded: Mutex::new(HashSet::new()),
            worker: Mutex::new(None),
        });
        let weak = Arc::downgrade(&preloader);
        let listener: Weak<dyn AccessListener> = weak;
        preloader.manager.add_access_listener(listener);
        preloader
    }

    pub fn config(&self) -> &PreloaderConfig {
        &self.config
    }

    pub fn state(&self) -> PreloaderState {
        *self.state.lock()
    }

    /// Spawn the worker. No-op while already running or paused.
    pub fn start(self: &Arc<Self>) -> ShardResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                current @ (PreloaderState::Running | PreloaderState::Paused) => {
                    debug!(model = self.manager.model(), state = %current, "preloader already started");
                    return Ok(());
                }
                PreloaderState::Idle | PreloaderState::Stopped => *state = PreloaderState::Running,
            }
        }

        let weak = Arc::downgrade(self);
        let spawned = BackgroundWorker::spawn(
            "shard-preloader",
            Duration::from_millis(self.config.check_interval_ms),
            move || {
                if let Some(preloader) = weak.upgrade() {
                    preloader.run_once();
                }
            },
        );
        match spawned {
            Ok(worker) => {
                *self.worker.lock() = Some(worker);
                info!(model = self.manager.model(), strategy = ?self.config.strategy, "preloader started");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = PreloaderState::Stopped;
                Err(e)
            }
        }
    }

    pub fn pause(&self) -> bool {
        let mut state = self.state.lock();
        if *state != PreloaderState::Running {
            return false;
        }
        *state = PreloaderState::Paused;
        info!(model = self.manager.model(), "preloader paused");
        true
    }

    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if *state != PreloaderState::Paused {
            return false;
        }
        *state = PreloaderState::Running;
        info!(model = self.manager.model(), "preloader resumed");
        true
    }

    /// Stop the worker, waiting at most `stop_timeout_ms` for an in-flight
    /// preload. Returns `false` when the worker had to be detached.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !matches!(*state, PreloaderState::Running | PreloaderState::Paused) {
                return true;
            }
            *state = PreloaderState::Stopped;
        }
        let joined = match self.worker.lock().take() {
            Some(mut worker) => worker.stop(Duration::from_millis(self.config.stop_timeout_ms)),
            None => true,
        };
        self.save_history();
        info!(model = self.manager.model(), joined, "preloader stopped");
        joined
    }

    /// Record an explicit access: bounded history, frequency and the
    /// transition from the previous access.
    pub fn record_access(&self, shard_id: &str) {
        self.history
            .lock()
            .record(shard_id, self.config.history_size.max(1));
        self.save_history();
    }

    fn save_history(&self) {
        let Some(path) = &self.config.history_path else {
            return;
        };
        let history = self.history.lock().clone();
        if let Err(e) = write_json_atomic(path, &history) {
            warn!(path = %path.display(), error = %e, "failed to save preload history");
        }
    }

    fn predict_sequential(&self, history: &AccessHistory, current: &str) -> Vec<String> {
        let successors: Vec<String> = history
            .transitions
            .iter()
            .filter(|t| t.from == current)
            .map(|t| t.to.clone())
            .collect();
        if !successors.is_empty() {
            return successors;
        }

        next_in_sequence(current)
            .filter(|next| {
                self.manager
                    .store()
                    .with_model(self.manager.model(), |meta| meta.contains(next))
                    .unwrap_or(false)
            })
            .into_iter()
            .collect()
    }

    fn predict_dependency(&self, current: &str) -> Vec<String> {
        self.manager.dependents(current).unwrap_or_default()
    }

    fn predict_frequency(&self, history: &AccessHistory) -> Vec<String> {
        let mut ranked: Vec<(&String, &u64)> = history.frequency.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(self.config.max_preload_shards)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Shards predicted to be requested after `current` (the most recent
    /// access when `None`), best first, excluding shards already cached,
    /// loading, preloading or preloaded.
    pub fn predict_next_shard(&self, current: Option<&str>) -> Vec<String> {
        let predicted = {
            let history = self.history.lock();
            let Some(current) = current.or_else(|| history.current()).map(str::to_string) else {
                return Vec::new();
            };
            match self.config.strategy {
                PreloadStrategy::Sequential => self.predict_sequential(&history, &current),
                PreloadStrategy::Dependency => self.predict_dependency(&current),
                PreloadStrategy::Frequency => self.predict_frequency(&history),
                PreloadStrategy::Hybrid => {
                    let mut seen = HashSet::new();
                    self.predict_sequential(&history, &current)
                        .into_iter()
                        .chain(self.predict_dependency(&current))
                        .chain(self.predict_frequency(&history))
                        .filter(|id| seen.insert(id.clone()))
                        .collect()
                }
            }
        };

        let preloading = self.preloading.lock().clone();
        let preloaded = self.preloaded.lock().clone();
        predicted
            .into_iter()
            .filter(|id| {
                !preloading.contains(id)
                    && !preloaded.contains(id)
                    && !self.manager.is_cached(id)
                    && !self.manager.is_loading(id)
            })
            .collect()
    }

    fn resources_available(&self) -> bool {
        let cpu = self.probe.cpu_percent();
        if cpu >= self.config.max_cpu_percent {
            debug!(cpu, limit = self.config.max_cpu_percent, "preload gated on cpu");
            return false;
        }
        let memory = self.probe.memory_percent();
        if memory >= self.config.max_memory_percent {
            debug!(memory, limit = self.config.max_memory_percent, "preload gated on memory");
            return false;
        }
        if let Some(gpu) = self.probe.gpu_memory_percent() {
            if gpu >= self.config.max_memory_percent {
                debug!(gpu, limit = self.config.max_memory_percent, "preload gated on gpu memory");
                return false;
            }
        }
        true
    }

    fn next_candidate(&self) -> Option<String> {
        // Predict before taking the queue lock: prediction takes the history lock.
        let refill = if self.queue.lock().is_empty() {
            self.predict_next_shard(None)
        } else {
            Vec::new()
        };
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            queue.extend(refill);
        }
        while let Some(shard_id) = queue.pop_front() {
            if !self.manager.is_cached(&shard_id) && !self.preloading.lock().contains(&shard_id) {
                return Some(shard_id);
            }
        }
        None
    }

    /// One worker iteration. Returns the shard preloaded, if any.
    pub fn run_once(&self) -> Option<String> {
        if self.state() != PreloaderState::Running {
            return None;
        }
        if self.preloading.lock().len() >= self.config.max_preload_shards {
            return None;
        }
        if !self.resources_available() {
            return None;
        }

        let shard_id = self.next_candidate()?;
        if !self.preloading.lock().insert(shard_id.clone()) {
            return None;
        }

        debug!(shard_id = %shard_id, "preloading shard");
        let result = self.manager.preload_shard(&shard_id);
        self.preloading.lock().remove(&shard_id);

        match result {
            Ok(true) => {
                self.preloaded.lock().insert(shard_id.clone());
                info!(shard_id = %shard_id, "preloaded shard");
                Some(shard_id)
            }
            Ok(false) => {
                debug!(shard_id = %shard_id, "preload produced nothing");
                None
            }
            Err(e) => {
                warn!(shard_id = %shard_id, error = %e, "preload failed");
                None
            }
        }
    }

    pub fn preload_stats(&self) -> PreloadStats {
        let mut preloading: Vec<String> = self.preloading.lock().iter().cloned().collect();
        preloading.sort();
        let mut preloaded: Vec<String> = self.preloaded.lock().iter().cloned().collect();
        preloaded.sort();
        let queue_size = self.queue.lock().len();
        let (history_size, unique_shards, transitions) = {
            let history = self.history.lock();
            (
                history.history.len(),
                history.frequency.len(),
                history.transitions.len(),
            )
        };
        PreloadStats {
            state: self.state(),
            strategy: self.config.strategy,
            preloading,
            preloaded,
            queue_size,
            history_size,
            unique_shards,
            transitions,
        }
    }
}

impl<V: ShardPayload> AccessListener for Preloader<V> {
    fn on_access(&self, shard_id: &str) {
        self.record_access(shard_id);
    }
}

impl<V: ShardPayload> Drop for Preloader<V> {
    fn drop(&mut self) {
        // Dropping the worker disconnects it; the loop exits on its next wait.
        self.worker.lock().take();
    }
}

fn load_history(path: &std::path::Path, limit: usize) -> AccessHistory {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AccessHistory::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read preload history");
            return AccessHistory::default();
        }
    };
    match serde_json::from_str::<AccessHistory>(&content) {
        Ok(mut history) => {
            while history.history.len() > limit.max(1) {
                history.history.pop_front();
            }
            history.transitions.sort_by(|a, b| b.count.cmp(&a.count));
            debug!(path = %path.display(), entries = history.history.len(), "loaded preload history");
            history
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable preload history");
            AccessHistory::default()
        }
    }
}
