//! Model-level shard lifecycle.
//!
//! A [`ShardManager`] owns the cache for one model and composes the rest of
//! the subsystem around it:
//!
//! ```text
//! load_shard ─▶ ShardCache ─▶ LoadPipeline ─▶ monitor ─▶ recovery ─▶ source
//!                  ▲
//!          StrategyManager (policy selection, hot switch)
//! ```
//!
//! Recursive loads resolve the dependency order from metadata first, so every
//! dependency is admitted before its dependent's source load runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, ClearReport, ShardCache};
use crate::clock::{system_clock, Clock};
use crate::config::ShardConfig;
use crate::error::{ShardError, ShardResult};
use crate::integrity::IntegrityChecker;
use crate::keyring::KeyRing;
use crate::metadata::{MetadataStore, ModelMetadata};
use crate::monitor::ShardMonitor;
use crate::pipeline::{LoadInterceptor, LoadPipeline, ShardSource};
use crate::policy::{AdmitOptions, EntryStats, PolicyKind};
use crate::recovery::RecoveryManager;
use crate::source::{FileShardSource, LoadedShard, ShardPayload};
use crate::strategy::{StrategyConfig, StrategyManager};
use crate::telemetry::{system_probe, ResourceProbe};

const MIB: f64 = 1024.0 * 1024.0;

/// Observer of explicitly requested shards.
pub trait AccessListener: Send + Sync {
    fn on_access(&self, shard_id: &str);
}

/// Builder for [`ShardManager`].
pub struct ShardManagerBuilder<V> {
    model: String,
    store: Arc<MetadataStore>,
    source: Arc<dyn ShardSource<V>>,
    strategy: StrategyConfig,
    probe: Option<Arc<dyn ResourceProbe>>,
    clock: Option<Arc<dyn Clock>>,
    monitor: Option<Arc<ShardMonitor>>,
    recovery: Option<Arc<RecoveryManager<V>>>,
    integrity: Option<Arc<IntegrityChecker>>,
    interceptors: Vec<Arc<dyn LoadInterceptor<V>>>,
}

impl<V: ShardPayload> ShardManagerBuilder<V> {
    pub fn with_strategy_config(mut self, config: StrategyConfig) -> Self {
        self.strategy = config;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<ShardMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager<V>>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_integrity(mut self, checker: Arc<IntegrityChecker>) -> Self {
        self.integrity = Some(checker);
        self
    }

    /// Extra interceptor, placed by its stage.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn LoadInterceptor<V>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Build the manager and warm up configured layers.
    ///
    /// Fails when the model has no metadata or the selected policy
    /// configuration is invalid. Warm-up failures are logged only.
    pub fn build(self) -> ShardResult<ShardManager<V>> {
        let shard_count = self.store.with_model(&self.model, ModelMetadata::len)?;
        let probe = self.probe.unwrap_or_else(system_probe);
        let clock = self.clock.unwrap_or_else(system_clock);
        let strategy = StrategyManager::new(self.strategy, probe, clock);
        let policy = strategy.create_policy::<V>(&self.model)?;

        let mut pipeline = LoadPipeline::new(self.source);
        if let Some(monitor) = &self.monitor {
            pipeline = pipeline.with_interceptor(monitor.clone());
        }
        if let Some(recovery) = &self.recovery {
            pipeline = pipeline.with_interceptor(recovery.clone());
        }
        for interceptor in self.interceptors {
            pipeline = pipeline.with_interceptor(interceptor);
        }

        let manager = ShardManager {
            model: self.model,
            store: self.store,
            cache: ShardCache::new(policy, pipeline),
            strategy,
            monitor: self.monitor,
            recovery: self.recovery,
            integrity: self.integrity,
            listeners: RwLock::new(Vec::new()),
        };
        info!(
            model = %manager.model,
            shards = shard_count,
            strategy = %manager.cache.kind(),
            capacity = manager.cache.capacity(),
            layers = ?manager.cache.pipeline().layers(),
            "shard manager ready"
        );

        if !manager.strategy.config().warm_up_layers.is_empty() {
            if let Err(e) = manager.warm_up() {
                warn!(model = %manager.model, error = %e, "cache warm-up failed");
            }
        }
        Ok(manager)
    }
}

/// Loads, caches and releases the shards of one model.
pub struct ShardManager<V: ShardPayload> {
    model: String,
    store: Arc<MetadataStore>,
    cache: ShardCache<V>,
    strategy: StrategyManager,
    monitor: Option<Arc<ShardMonitor>>,
    recovery: Option<Arc<RecoveryManager<V>>>,
    integrity: Option<Arc<IntegrityChecker>>,
    listeners: RwLock<Vec<Weak<dyn AccessListener>>>,
}

impl ShardManager<Arc<LoadedShard>> {
    /// File-backed manager assembled from configuration, with the monitor,
    /// recovery and integrity checker installed.
    pub fn open(model: &str, config: &ShardConfig) -> ShardResult<Self> {
        let store = match &config.metadata_dir {
            Some(dir) => MetadataStore::new(dir),
            None => MetadataStore::with_default_dir()?,
        };
        Self::open_with_store(model, Arc::new(store), config)
    }

    pub fn open_with_store(
        model: &str,
        store: Arc<MetadataStore>,
        config: &ShardConfig,
    ) -> ShardResult<Self> {
        let shard_dir = config.shard_dir.clone();
        let checker = Arc::new(
            IntegrityChecker::new(store.clone(), &shard_dir)
                .with_keys(KeyRing::from_env())
                .with_config(config.integrity.clone()),
        );

        let mut source = FileShardSource::new(model, store.clone(), &shard_dir);
        if config.integrity.verify_on_load {
            source = source.with_verification(checker.clone(), config.integrity.level);
        }

        let monitor = Arc::new(ShardMonitor::new(config.monitor.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            model,
            checker.clone(),
            config.recovery.clone(),
        ));

        ShardManager::builder(model, store, Arc::new(source))
            .with_strategy_config(config.strategy.clone())
            .with_monitor(monitor)
            .with_recovery(recovery)
            .with_integrity(checker)
            .build()
    }
}

impl<V: ShardPayload> ShardManager<V> {
    pub fn builder(
        model: impl Into<String>,
        store: Arc<MetadataStore>,
        source: Arc<dyn ShardSource<V>>,
    ) -> ShardManagerBuilder<V> {
        ShardManagerBuilder {
            model: model.into(),
            store,
            source,
            strategy: StrategyConfig::default(),
            probe: None,
            clock: None,
            monitor: None,
            recovery: None,
            integrity: None,
            interceptors: Vec::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Snapshot of the model's metadata.
    pub fn metadata(&self) -> ShardResult<ModelMetadata> {
        self.store.snapshot(&self.model)
    }

    pub fn cache(&self) -> &ShardCache<V> {
        &self.cache
    }

    pub fn strategy(&self) -> &StrategyManager {
        &self.strategy
    }

    pub fn monitor(&self) -> Option<&Arc<ShardMonitor>> {
        self.monitor.as_ref()
    }

    pub fn recovery(&self) -> Option<&Arc<RecoveryManager<V>>> {
        self.recovery.as_ref()
    }

    pub fn integrity(&self) -> Option<&Arc<IntegrityChecker>> {
        self.integrity.as_ref()
    }

    pub fn add_access_listener(&self, listener: Weak<dyn AccessListener>) {
        self.listeners.write().push(listener);
    }

    fn notify_access(&self, shard_id: &str) {
        let live: Vec<Arc<dyn AccessListener>> = {
            let listeners = self.listeners.read();
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        if live.len() < self.listeners.read().len() {
            self.listeners.write().retain(|l| l.strong_count() > 0);
        }
        for listener in live {
            listener.on_access(shard_id);
        }
    }

    /// Admission parameters for a shard: size in MiB from metadata (1.0 when
    /// unknown) and the weight configured for the active strategy.
    pub fn admit_options(&self, shard_id: &str) -> AdmitOptions {
        let size_bytes = self
            .store
            .shard(&self.model, shard_id)
            .map(|r| r.size_bytes)
            .unwrap_or(0);
        let weight = self
            .strategy
            .current_config()
            .map(|c| c.weight_for(shard_id))
            .unwrap_or(1.0);
        AdmitOptions {
            size: if size_bytes == 0 {
                1.0
            } else {
                size_bytes as f64 / MIB
            },
            weight,
        }
    }

    fn fetch(&self, shard_id: &str) -> ShardResult<Option<V>> {
        self.cache.get_or_load(shard_id, self.admit_options(shard_id))
    }

    /// Load a shard, first loading its dependencies when `recursive`.
    ///
    /// A dependency that cannot be made resident fails the whole load with
    /// [`ShardError::DependencyUnavailable`] before the shard itself is read.
    pub fn load_shard(&self, shard_id: &str, recursive: bool) -> ShardResult<Option<V>> {
        self.notify_access(shard_id);
        // Membership first so a cold load records a single miss.
        if self.cache.contains(shard_id) {
            if let Some(value) = self.cache.get(shard_id, false) {
                return Ok(Some(value));
            }
        }

        if recursive {
            let order = self.get_loading_sequence(Some(&[shard_id.to_string()]))?;
            for dependency in order.iter().filter(|id| id.as_str() != shard_id) {
                if self.cache.contains(dependency) {
                    continue;
                }
                if let Some(monitor) = &self.monitor {
                    monitor.record_dependency_load(dependency);
                }
                let unavailable = || ShardError::DependencyUnavailable {
                    shard_id: shard_id.to_string(),
                    dependency: dependency.clone(),
                };
                match self.fetch(dependency) {
                    Ok(Some(_)) => debug!(shard_id, dependency = %dependency, "dependency resident"),
                    Ok(None) => return Err(unavailable()),
                    Err(e) => {
                        warn!(shard_id, dependency = %dependency, error = %e, "dependency load failed");
                        return Err(unavailable());
                    }
                }
            }
        }

        let loaded = self.fetch(shard_id)?;
        if loaded.is_some() {
            if let Err(e) = self.adjust_strategy_if_needed() {
                warn!(model = %self.model, error = %e, "strategy adjustment failed");
            }
        }
        Ok(loaded)
    }

    /// Background load: non-recursive and invisible to access listeners.
    pub fn preload_shard(&self, shard_id: &str) -> ShardResult<bool> {
        Ok(self.fetch(shard_id)?.is_some())
    }

    /// Dependency-respecting load order for `targets` (all shards if `None`).
    pub fn get_loading_sequence(&self, targets: Option<&[String]>) -> ShardResult<Vec<String>> {
        self.store
            .with_model(&self.model, |meta| meta.loading_order(targets))?
    }

    /// Load `shard_ids` and their dependencies in order, skipping cached
    /// shards. Returns the number newly loaded.
    pub fn prefetch_shards(&self, shard_ids: &[String]) -> ShardResult<usize> {
        let order = self.get_loading_sequence(Some(shard_ids))?;
        let mut loaded = 0;
        for shard_id in order {
            if self.cache.contains(&shard_id) {
                continue;
            }
            match self.fetch(&shard_id) {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => warn!(shard_id = %shard_id, "prefetch produced nothing"),
                Err(e) => warn!(shard_id = %shard_id, error = %e, "prefetch failed"),
            }
        }
        debug!(model = %self.model, loaded, "prefetched shards");
        Ok(loaded)
    }

    /// Layer name to owning shard id.
    pub fn layer_mapping(&self) -> ShardResult<HashMap<String, String>> {
        self.store.with_model(&self.model, ModelMetadata::layer_to_shard)
    }

    /// Resolve a layer to `(shard_id, mapped_layer)`: exact name first, then
    /// a mapped layer containing the name, then a mapped layer contained in it.
    fn resolve_layer(
        mapping: &HashMap<String, String>,
        layer: &str,
    ) -> Option<(String, String)> {
        if let Some(shard_id) = mapping.get(layer) {
            return Some((shard_id.clone(), layer.to_string()));
        }
        let mut names: Vec<&String> = mapping.keys().collect();
        names.sort();
        names
            .iter()
            .find(|name| name.contains(layer))
            .or_else(|| names.iter().find(|name| layer.contains(name.as_str())))
            .map(|name| (mapping[*name].clone(), (*name).clone()))
    }

    pub fn get_shard_for_layer(&self, layer: &str) -> ShardResult<Option<String>> {
        let mapping = self.layer_mapping()?;
        Ok(Self::resolve_layer(&mapping, layer).map(|(shard_id, _)| shard_id))
    }

    /// Load the shards owning `layers` (each shard once) and extract the
    /// per-layer views. Unresolvable layers are skipped with a warning.
    pub fn load_layers(&self, layers: &[String]) -> ShardResult<HashMap<String, V::Layer>> {
        let mapping = self.layer_mapping()?;
        let mut loaded: HashMap<String, Option<V>> = HashMap::new();
        let mut out = HashMap::new();

        for layer in layers {
            let Some((shard_id, mapped)) = Self::resolve_layer(&mapping, layer) else {
                warn!(model = %self.model, layer = %layer, "no shard contains layer");
                continue;
            };
            if !loaded.contains_key(&shard_id) {
                let payload = self.load_shard(&shard_id, true)?;
                loaded.insert(shard_id.clone(), payload);
            }
            match loaded.get(&shard_id).and_then(|p| p.as_ref()) {
                Some(payload) => match payload.layer(&mapped) {
                    Some(view) => {
                        out.insert(layer.clone(), view);
                    }
                    None => warn!(shard_id = %shard_id, layer = %layer, "layer missing from shard payload"),
                },
                None => warn!(shard_id = %shard_id, layer = %layer, "shard for layer could not be loaded"),
            }
        }
        Ok(out)
    }

    /// Prefetch the shards owning the configured warm-up layers.
    pub fn warm_up(&self) -> ShardResult<usize> {
        let mapping = self.layer_mapping()?;
        let mut seen = HashSet::new();
        let shard_ids: Vec<String> = self
            .strategy
            .config()
            .warm_up_layers
            .iter()
            .filter_map(|layer| Self::resolve_layer(&mapping, layer))
            .map(|(shard_id, _)| shard_id)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if shard_ids.is_empty() {
            return Ok(0);
        }
        let loaded = self.prefetch_shards(&shard_ids)?;
        info!(model = %self.model, loaded, "warmed up cache");
        Ok(loaded)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn entry_stats(&self) -> Vec<EntryStats> {
        self.cache.entry_stats()
    }

    pub fn resize_cache(&self, capacity: usize) -> Vec<String> {
        self.cache.resize(capacity)
    }

    pub fn clear_cache(&self) -> ClearReport {
        self.cache.clear()
    }

    /// Hot-switch the cache to the named strategy, keeping cached shards.
    pub fn switch_cache_strategy(&self, name: &str) -> ShardResult<Vec<String>> {
        self.strategy.switch_strategy(&self.cache, &self.model, name)
    }

    pub fn available_strategies(&self) -> Vec<&'static str> {
        StrategyManager::available_strategies()
    }

    pub fn adjust_strategy_if_needed(&self) -> ShardResult<Option<PolicyKind>> {
        self.strategy.adjust_strategy_if_needed(&self.cache, &self.model)
    }

    pub fn cached_shards(&self) -> Vec<String> {
        self.cache.keys()
    }

    pub fn is_cached(&self, shard_id: &str) -> bool {
        self.cache.contains(shard_id)
    }

    pub fn is_loading(&self, shard_id: &str) -> bool {
        self.cache.is_loading(shard_id)
    }

    /// Release one shard. `false` if it is not cached or the unload refused.
    pub fn unload_shard(&self, shard_id: &str) -> bool {
        self.cache.remove(shard_id)
    }

    /// Shards listing `shard_id` as a dependency.
    pub fn dependents(&self, shard_id: &str) -> ShardResult<Vec<String>> {
        self.store.with_model(&self.model, |meta| {
            meta.dependents(shard_id).into_iter().collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ShardRecord;
    use crate::pipeline::FnSource;
    use crate::policy::PolicyConfig;
    use crate::telemetry::StaticProbe;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Blob {
        id: String,
        layers: Vec<String>,
    }

    impl ShardPayload for Blob {
        type Layer = String;

        fn layer(&self, name: &str) -> Option<String> {
            self.layers
                .iter()
                .any(|l| l == name)
                .then(|| format!("{}:{}", self.id, name))
        }
    }

    type LoadLog = Arc<Mutex<Vec<String>>>;

    fn chain_store() -> Arc<MetadataStore> {
        let store = Arc::new(MetadataStore::in_memory());
        store
            .add_shard("m", "s1", ShardRecord::new().with_layers(["embed"]))
            .unwrap();
        store
            .add_shard(
                "m",
                "s2",
                ShardRecord::new()
                    .with_layers(["block.0.attn", "block.0.mlp"])
                    .with_dependencies(["s1"]),
            )
            .unwrap();
        store
            .add_shard(
                "m",
                "s3",
                ShardRecord::new()
                    .with_layers(["head"])
                    .with_dependencies(["s2"]),
            )
            .unwrap();
        store
    }

    fn create_test_manager(capacity: usize, failing: &[&str]) -> (ShardManager<Blob>, LoadLog) {
        let store = chain_store();
        let log: LoadLog = Arc::new(Mutex::new(Vec::new()));
        let source_log = log.clone();
        let source_store = store.clone();
        let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
        let source = FnSource::new(move |id: &str| -> ShardResult<Option<Blob>> {
            source_log.lock().push(id.to_string());
            if failing.iter().any(|f| f == id) {
                return Err(ShardError::LoadFailed {
                    shard_id: id.to_string(),
                    reason: "unreadable".into(),
                });
            }
            let record = source_store.shard("m", id)?;
            Ok(Some(Blob {
                id: id.to_string(),
                layers: record.layers,
            }))
        });

        let manager = ShardManager::builder("m", store, Arc::new(source))
            .with_strategy_config(
                StrategyConfig::default().with_global(PolicyConfig::new(PolicyKind::Lru, capacity)),
            )
            .with_probe(Arc::new(StaticProbe::new(10.0, 40.0, 4096 * 1024 * 1024)))
            .build()
            .unwrap();
        (manager, log)
    }

    // ==================== Loading ====================

    #[test]
    fn test_recursive_load_orders_dependencies() {
        let (manager, log) = create_test_manager(5, &[]);
        let blob = manager.load_shard("s3", true).unwrap().unwrap();
        assert_eq!(blob.id, "s3");
        assert_eq!(*log.lock(), vec!["s1", "s2", "s3"]);
        let mut cached = manager.cached_shards();
        cached.sort();
        assert_eq!(cached, vec!["s1", "s2", "s3"]);

        manager.load_shard("s3", true).unwrap();
        assert_eq!(log.lock().len(), 3);
    }

    #[test]
    fn test_non_recursive_load_skips_dependencies() {
        let (manager, log) = create_test_manager(5, &[]);
        manager.load_shard("s3", false).unwrap();
        assert_eq!(*log.lock(), vec!["s3"]);
    }

    #[test]
    fn test_failed_dependency_blocks_dependent() {
        let (manager, log) = create_test_manager(5, &["s1"]);
        let err = manager.load_shard("s3", true).unwrap_err();
        assert!(matches!(
            err,
            ShardError::DependencyUnavailable { ref shard_id, ref dependency }
                if shard_id == "s3" && dependency == "s1"
        ));
        assert_eq!(*log.lock(), vec!["s1"]);
        assert!(manager.cached_shards().is_empty());
    }

    #[test]
    fn test_missing_dependency_is_reported() {
        let (manager, _log) = create_test_manager(5, &[]);
        manager
            .store()
            .add_shard("m", "s4", ShardRecord::new().with_dependencies(["s5"]))
            .unwrap();
        let err = manager
            .get_loading_sequence(Some(&["s4".to_string()]))
            .unwrap_err();
        assert!(matches!(err, ShardError::MissingDependencies { .. }));
        assert!(manager.load_shard("s4", true).is_err());
    }

    #[test]
    fn test_prefetch_counts_new_loads() {
        let (manager, _log) = create_test_manager(5, &[]);
        manager.load_shard("s1", false).unwrap();
        assert_eq!(manager.prefetch_shards(&["s3".to_string()]).unwrap(), 2);
        assert_eq!(manager.prefetch_shards(&["s3".to_string()]).unwrap(), 0);
    }

    #[test]
    fn test_unknown_model_fails_build() {
        let source = FnSource::new(|_: &str| -> ShardResult<Option<Blob>> { Ok(None) });
        let result = ShardManager::builder("ghost", Arc::new(MetadataStore::in_memory()), Arc::new(source))
            .with_probe(Arc::new(StaticProbe::new(0.0, 0.0, u64::MAX)))
            .build();
        assert!(matches!(result, Err(ShardError::UnknownModel { .. })));
    }

    // ==================== Layers ====================

    #[test]
    fn test_layer_resolution() {
        let (manager, _log) = create_test_manager(5, &[]);
        assert_eq!(manager.get_shard_for_layer("head").unwrap().as_deref(), Some("s3"));
        assert_eq!(manager.get_shard_for_layer("attn").unwrap().as_deref(), Some("s2"));
        assert_eq!(manager.get_shard_for_layer("nothing").unwrap(), None);
    }

    #[test]
    fn test_load_layers_dedupes_shards() {
        let (manager, log) = create_test_manager(5, &[]);
        let layers: Vec<String> = ["block.0.attn", "block.0.mlp", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = manager.load_layers(&layers).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out["block.0.mlp"], "s2:block.0.mlp");
        assert_eq!(*log.lock(), vec!["s1", "s2"]);
    }

    #[test]
    fn test_warm_up_on_build() {
        let store = chain_store();
        let source = FnSource::new(|id: &str| -> ShardResult<Option<Blob>> {
            Ok(Some(Blob {
                id: id.to_string(),
                layers: Vec::new(),
            }))
        });
        let manager = ShardManager::builder("m", store, Arc::new(source))
            .with_strategy_config(StrategyConfig::default().with_warm_up_layers(["embed", "head"]))
            .with_probe(Arc::new(StaticProbe::new(0.0, 0.0, 4096 * 1024 * 1024)))
            .build()
            .unwrap();
        let mut cached = manager.cached_shards();
        cached.sort();
        assert_eq!(cached, vec!["s1", "s2", "s3"]);
    }

    // ==================== Strategy ====================

    #[test]
    fn test_switch_strategy_preserves_keys() {
        let (manager, _log) = create_test_manager(5, &[]);
        manager.load_shard("s3", true).unwrap();
        let mut before = manager.cached_shards();
        before.sort();

        let evicted = manager.switch_cache_strategy("LFU").unwrap();
        assert!(evicted.is_empty());
        let mut after = manager.cached_shards();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(manager.cache_stats().strategy, "LFU");
        assert!(manager.switch_cache_strategy("MRU").is_err());
        assert_eq!(manager.available_strategies().len(), 5);
    }

    #[test]
    fn test_access_listeners() {
        struct Recorder(Mutex<Vec<String>>);
        impl AccessListener for Recorder {
            fn on_access(&self, shard_id: &str) {
                self.0.lock().push(shard_id.to_string());
            }
        }

        let (manager, _log) = create_test_manager(5, &[]);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak = Arc::downgrade(&recorder);
        let listener: Weak<dyn AccessListener> = weak;
        manager.add_access_listener(listener);

        manager.load_shard("s2", true).unwrap();
        manager.preload_shard("s3").unwrap();
        assert_eq!(*recorder.0.lock(), vec!["s2"]);

        drop(recorder);
        manager.load_shard("s1", false).unwrap();
        assert!(manager.listeners.read().is_empty());
    }

    #[test]
    fn test_cold_load_counts_one_miss() {
        let (manager, _log) = create_test_manager(4, &[]);
        manager.load_shard("s1", false).unwrap();
        let stats = manager.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.loads), (0, 1, 1));

        manager.load_shard("s1", false).unwrap();
        let stats = manager.cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));

        // Resident dependency s1 is skipped; s2 adds one miss.
        manager.load_shard("s2", true).unwrap();
        let stats = manager.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.loads), (1, 2, 2));
    }

    #[test]
    fn test_admit_options_from_metadata() {
        let (manager, _log) = create_test_manager(5, &[]);
        manager
            .store()
            .update_shard("m", "s1", |r| r.size_bytes = 3 * 1024 * 1024)
            .unwrap();
        assert!((manager.admit_options("s1").size - 3.0).abs() < 1e-9);
        assert!((manager.admit_options("s2").size - 1.0).abs() < 1e-9);
    }
}
