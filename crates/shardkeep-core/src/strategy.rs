//! Cache strategy selection and hot switching.
//!
//! Policy configuration is resolved by priority:
//!
//! 1. per-model configuration
//! 2. per-memory-tier configuration
//! 3. the global default
//!
//! Memory tiers are derived from available host memory. When a tier change
//! maps to a different configured policy, the active cache is hot-switched:
//! entries are drained from the old policy and re-admitted into the new one,
//! preserving the cached key set but not recency/frequency statistics.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::ShardCache;
use crate::clock::Clock;
use crate::error::ShardResult;
use crate::policy::{create_policy, CachePolicy, PolicyConfig, PolicyKind};
use crate::telemetry::ResourceProbe;

const MIB: u64 = 1024 * 1024;

/// Host memory pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryTier {
    Critical,
    Low,
    Normal,
    High,
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "CRITICAL",
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        };
        f.write_str(name)
    }
}

/// Available-memory boundaries between tiers, in MiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    /// Below this: CRITICAL.
    pub critical_mb: u64,
    /// Below this: LOW.
    pub low_mb: u64,
    /// Above this: HIGH.
    pub high_mb: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            critical_mb: 512,
            low_mb: 2048,
            high_mb: 8192,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, available_bytes: u64) -> MemoryTier {
        let available_mb = available_bytes / MIB;
        if available_mb < self.critical_mb {
            MemoryTier::Critical
        } else if available_mb < self.low_mb {
            MemoryTier::Low
        } else if available_mb > self.high_mb {
            MemoryTier::High
        } else {
            MemoryTier::Normal
        }
    }
}

/// Strategy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub global: PolicyConfig,
    pub models: HashMap<String, PolicyConfig>,
    pub tiers: HashMap<MemoryTier, PolicyConfig>,
    pub thresholds: TierThresholds,
    /// Switch strategies automatically on tier changes.
    pub auto_adjust: bool,
    /// Layers whose shards are loaded when a manager starts.
    pub warm_up_layers: Vec<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            global: PolicyConfig::default(),
            models: HashMap::new(),
            tiers: HashMap::new(),
            thresholds: TierThresholds::default(),
            auto_adjust: true,
            warm_up_layers: Vec::new(),
        }
    }
}

impl StrategyConfig {
    pub fn with_global(mut self, config: PolicyConfig) -> Self {
        self.global = config;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, config: PolicyConfig) -> Self {
        self.models.insert(model.into(), config);
        self
    }

    pub fn with_tier(mut self, tier: MemoryTier, config: PolicyConfig) -> Self {
        self.tiers.insert(tier, config);
        self
    }

    pub fn with_thresholds(mut self, thresholds: TierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_warm_up_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warm_up_layers = layers.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Default)]
struct ActiveStrategy {
    tier: Option<MemoryTier>,
    config: Option<PolicyConfig>,
}

/// Creates cache policies and performs hot switches.
pub struct StrategyManager {
    config: StrategyConfig,
    probe: Arc<dyn ResourceProbe>,
    clock: Arc<dyn Clock>,
    active: Mutex<ActiveStrategy>,
}

impl StrategyManager {
    pub fn new(config: StrategyConfig, probe: Arc<dyn ResourceProbe>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            probe,
            clock,
            active: Mutex::new(ActiveStrategy::default()),
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Tier for the current available memory.
    pub fn current_tier(&self) -> MemoryTier {
        self.config
            .thresholds
            .tier_for(self.probe.available_memory_bytes())
    }

    /// Strategy of the most recently created policy.
    pub fn current_strategy(&self) -> Option<PolicyKind> {
        self.active.lock().config.as_ref().map(|c| c.strategy)
    }

    /// Configuration of the most recently created policy.
    pub fn current_config(&self) -> Option<PolicyConfig> {
        self.active.lock().config.clone()
    }

    pub fn available_strategies() -> Vec<&'static str> {
        PolicyKind::available()
    }

    /// Resolve the configuration for `model` at `tier`.
    pub fn select_config(&self, model: &str, tier: MemoryTier) -> &PolicyConfig {
        self.config
            .models
            .get(model)
            .or_else(|| self.config.tiers.get(&tier))
            .unwrap_or(&self.config.global)
    }

    /// Create the policy selected for `model` and record it as active.
    pub fn create_policy<V>(&self, model: &str) -> ShardResult<Box<dyn CachePolicy<V>>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let tier = self.current_tier();
        let config = self.select_config(model, tier).clone();
        config.validate()?;
        info!(model, tier = %tier, strategy = %config.strategy, capacity = config.capacity, "selected cache strategy");
        let policy = create_policy(&config, self.clock.clone());
        *self.active.lock() = ActiveStrategy {
            tier: Some(tier),
            config: Some(config),
        };
        Ok(policy)
    }

    /// Configuration to use when switching `model` to `kind`: the first
    /// configured entry naming that strategy, else the active parameters.
    fn config_for_kind(&self, model: &str, kind: PolicyKind) -> PolicyConfig {
        let tier = self.current_tier();
        let configured = self
            .config
            .models
            .get(model)
            .into_iter()
            .chain(self.config.tiers.get(&tier))
            .chain(std::iter::once(&self.config.global))
            .find(|c| c.strategy == kind);
        if let Some(config) = configured {
            return config.clone();
        }

        let mut config = self
            .current_config()
            .unwrap_or_else(|| self.select_config(model, tier).clone());
        config.strategy = kind;
        config
    }

    /// Hot-switch `cache` to the named strategy. Returns keys evicted because
    /// the new capacity is smaller.
    pub fn switch_strategy<V>(
        &self,
        cache: &ShardCache<V>,
        model: &str,
        name: &str,
    ) -> ShardResult<Vec<String>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let kind: PolicyKind = name.parse()?;
        let config = self.config_for_kind(model, kind);
        self.install(cache, config)
    }

    fn install<V>(&self, cache: &ShardCache<V>, config: PolicyConfig) -> ShardResult<Vec<String>>
    where
        V: Clone + Send + Sync + 'static,
    {
        config.validate()?;
        let policy = create_policy(&config, self.clock.clone());
        let evicted = cache.swap_policy(policy);
        self.active.lock().config = Some(config);
        Ok(evicted)
    }

    /// Recompute the memory tier and hot-switch when the tier's configured
    /// policy differs from the active one. Returns the new strategy on switch.
    pub fn adjust_strategy_if_needed<V>(
        &self,
        cache: &ShardCache<V>,
        model: &str,
    ) -> ShardResult<Option<PolicyKind>>
    where
        V: Clone + Send + Sync + 'static,
    {
        if !self.config.auto_adjust {
            return Ok(None);
        }

        let tier = self.current_tier();
        let previous = {
            let mut active = self.active.lock();
            let previous = active.tier;
            active.tier = Some(tier);
            previous
        };
        if previous == Some(tier) {
            return Ok(None);
        }
        debug!(model, from = ?previous, to = %tier, "memory tier changed");

        if self.config.models.contains_key(model) {
            return Ok(None);
        }

        let desired = self.select_config(model, tier).clone();
        let unchanged = self.current_config().is_some_and(|current| {
            current.strategy == desired.strategy && current.capacity == desired.capacity
        });
        if unchanged {
            return Ok(None);
        }

        let kind = desired.strategy;
        info!(model, tier = %tier, strategy = %kind, "adjusting cache strategy for memory tier");
        self.install(cache, desired)?;
        Ok(Some(kind))
    }
}
