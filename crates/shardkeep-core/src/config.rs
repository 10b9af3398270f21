//! Aggregated subsystem configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ShardError, ShardResult};
use crate::integrity::{IntegrityConfig, VerificationLevel};
use crate::monitor::MonitorConfig;
use crate::policy::PolicyKind;
use crate::preloader::PreloaderConfig;
use crate::recovery::{RecoveryConfig, RecoveryStrategy};
use crate::strategy::StrategyConfig;
use crate::unload::UnloadConfig;

/// Configuration for a shard manager and its background components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Directory shard paths are resolved against.
    pub shard_dir: PathBuf,
    /// Metadata directory. Defaults to `<cache>/shardkeep/metadata`.
    pub metadata_dir: Option<PathBuf>,
    pub strategy: StrategyConfig,
    pub preloader: PreloaderConfig,
    pub unload: UnloadConfig,
    pub recovery: RecoveryConfig,
    pub monitor: MonitorConfig,
    pub integrity: IntegrityConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_dir: PathBuf::from("shards"),
            metadata_dir: None,
            strategy: StrategyConfig::default(),
            preloader: PreloaderConfig::default(),
            unload: UnloadConfig::default(),
            recovery: RecoveryConfig::default(),
            monitor: MonitorConfig::default(),
            integrity: IntegrityConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring invalid environment value");
            None
        }
    }
}

impl ShardConfig {
    /// Defaults overridden from environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `SHARDKEEP_SHARD_DIR` | `shard_dir` |
    /// | `SHARDKEEP_METADATA_DIR` | `metadata_dir` |
    /// | `SHARDKEEP_CACHE_STRATEGY` | `strategy.global.strategy` |
    /// | `SHARDKEEP_CACHE_CAPACITY` | `strategy.global.capacity` |
    /// | `SHARDKEEP_VERIFY_LEVEL` | `integrity.level` |
    /// | `SHARDKEEP_RECOVERY_STRATEGY` | `recovery.strategy` |
    /// | `SHARDKEEP_MAX_RETRIES` | `recovery.max_retries` |
    /// | `SHARDKEEP_MEMORY_THRESHOLD` | `unload.memory_threshold` |
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("SHARDKEEP_SHARD_DIR") {
            config.shard_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SHARDKEEP_METADATA_DIR") {
            config.metadata_dir = Some(PathBuf::from(dir));
        }
        if let Some(kind) = env_parse::<PolicyKind>("SHARDKEEP_CACHE_STRATEGY") {
            config.strategy.global.strategy = kind;
        }
        if let Some(capacity) = env_parse::<usize>("SHARDKEEP_CACHE_CAPACITY").filter(|c| *c > 0) {
            config.strategy.global.capacity = capacity;
        }
        if let Some(level) = env_parse::<VerificationLevel>("SHARDKEEP_VERIFY_LEVEL") {
            config.integrity.level = level;
        }
        if let Some(strategy) = env_parse::<RecoveryStrategy>("SHARDKEEP_RECOVERY_STRATEGY") {
            config.recovery.strategy = strategy;
        }
        if let Some(retries) = env_parse::<usize>("SHARDKEEP_MAX_RETRIES") {
            config.recovery.max_retries = retries;
        }
        if let Some(threshold) = env_parse::<f32>("SHARDKEEP_MEMORY_THRESHOLD")
            .filter(|t| (0.0..=100.0).contains(t))
        {
            config.unload.memory_threshold = threshold;
        }
        config
    }

    /// Read a JSON configuration file. Missing sections take defaults.
    pub fn load(path: impl AsRef<Path>) -> ShardResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ShardError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| ShardError::Config {
            message: format!("invalid config {}: {}", path.display(), e),
        })
    }

    pub fn with_shard_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shard_dir = dir.into();
        self
    }

    pub fn with_metadata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metadata_dir = Some(dir.into());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_preloader(mut self, preloader: PreloaderConfig) -> Self {
        self.preloader = preloader;
        self
    }

    pub fn with_unload(mut self, unload: UnloadConfig) -> Self {
        self.unload = unload;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_integrity(mut self, integrity: IntegrityConfig) -> Self {
        self.integrity = integrity;
        self
    }
}
