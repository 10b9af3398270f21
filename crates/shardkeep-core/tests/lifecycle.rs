//! End-to-end shard lifecycle against files on disk.
//!
//! Each test builds a three-shard chain `s1 <- s2 <- s3` in a temp dir with
//! file-backed metadata, then drives it through a `ShardManager` opened from
//! `ShardConfig` (monitor, recovery and integrity installed).

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use shardkeep_core::{
    IntegrityChecker, IntegrityConfig, LoadedShard, MetadataStore, PolicyKind, RecoveryAction,
    RecoveryConfig, RecoveryStrategy, ShardConfig, ShardError, ShardManager, ShardRecord,
    SuggestionKind, VerificationLevel,
};
use tempfile::TempDir;

const MODEL: &str = "tiny";

struct Fixture {
    dir: TempDir,
    store: Arc<MetadataStore>,
    config: ShardConfig,
}

impl Fixture {
    fn shard_dir(&self) -> PathBuf {
        self.dir.path().join("shards")
    }

    fn metadata_dir(&self) -> PathBuf {
        self.dir.path().join("metadata")
    }

    fn open(&self) -> ShardManager<Arc<LoadedShard>> {
        ShardManager::open_with_store(MODEL, self.store.clone(), &self.config).unwrap()
    }

    fn stored_hash(&self, shard_id: &str) -> Option<String> {
        self.store.shard(MODEL, shard_id).unwrap().hash
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("shardkeep_core=debug"))
        .with_test_writer()
        .try_init();
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn create_fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let shard_dir = dir.path().join("shards");
    let metadata_dir = dir.path().join("metadata");
    fs::create_dir_all(&shard_dir).unwrap();

    let store = Arc::new(MetadataStore::new(&metadata_dir));
    store.create_model(MODEL);
    let chain: [(&str, &[&str], &[&str]); 3] = [
        ("s1", &["embed"], &[]),
        ("s2", &["block.0.attn", "block.0.mlp"], &["s1"]),
        ("s3", &["head"], &["s2"]),
    ];
    for (id, layers, deps) in chain {
        let content = format!("GGUF shard {}", id);
        fs::write(shard_dir.join(format!("{}.bin", id)), &content).unwrap();
        store
            .add_shard(
                MODEL,
                id,
                ShardRecord::new()
                    .with_path(format!("{}.bin", id))
                    .with_layers(layers.iter().copied())
                    .with_dependencies(deps.iter().copied())
                    .with_size(content.len() as u64),
            )
            .unwrap();
    }
    IntegrityChecker::new(store.clone(), &shard_dir)
        .update_all_hashes(MODEL)
        .unwrap();

    let mut config = ShardConfig::default()
        .with_shard_dir(&shard_dir)
        .with_metadata_dir(&metadata_dir)
        .with_recovery(
            RecoveryConfig::default().with_retry_backoff(Duration::ZERO, Duration::ZERO),
        );
    // Host memory must not trigger tier switches mid-test.
    config.strategy.auto_adjust = false;
    Fixture { dir, store, config }
}

#[test]
fn test_recursive_load_end_to_end() {
    init_tracing();
    let fx = create_fixture();
    let manager = fx.open();

    let order = manager.get_loading_sequence(None).unwrap();
    assert_eq!(order, vec!["s1", "s2", "s3"]);

    let shard = manager.load_shard("s3", true).unwrap().unwrap();
    assert_eq!(shard.bytes, b"GGUF shard s3");
    assert_eq!(shard.layers, vec!["head"]);

    let mut cached = manager.cached_shards();
    cached.sort();
    assert_eq!(cached, vec!["s1", "s2", "s3"]);

    let monitor = manager.monitor().unwrap();
    assert_eq!(monitor.stats().total_loads, 3);
    assert_eq!(monitor.loading_pattern("s1").unwrap().as_dependency_count, 1);

    let stats = manager.cache_stats();
    assert_eq!(stats.loads, 3);
    assert_eq!(stats.strategy, "LRU");

    // Metadata written by the hash update is readable by a fresh store.
    let reloaded = MetadataStore::new(fx.metadata_dir());
    let meta = reloaded.snapshot(MODEL).unwrap();
    assert_eq!(meta.len(), 3);
    assert!(meta.shard("s2").unwrap().hash.is_some());
}

#[test]
fn test_layers_resolve_to_owning_shards() {
    let fx = create_fixture();
    let manager = fx.open();

    assert_eq!(manager.get_shard_for_layer("mlp").unwrap().as_deref(), Some("s2"));
    let layers = manager
        .load_layers(&["embed".to_string(), "block.0.mlp".to_string()])
        .unwrap();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers["block.0.mlp"].shard_id, "s2");
}

#[test]
fn test_missing_dependency_is_reported() {
    let fx = create_fixture();
    let manager = fx.open();
    fx.store
        .add_shard(MODEL, "s4", ShardRecord::new().with_dependencies(["s5"]))
        .unwrap();

    let missing = fx
        .store
        .with_model(MODEL, |meta| meta.verify_dependencies())
        .unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing["s4"], vec!["s5"]);

    let err = manager.load_shard("s4", true).unwrap_err();
    assert!(matches!(err, ShardError::MissingDependencies { .. }));
    assert!(err.to_string().contains("s4 requires [s5]"));
    assert!(!manager.is_cached("s4"));
}

#[test]
fn test_dependency_cycle_is_rejected() {
    let fx = create_fixture();
    let manager = fx.open();
    fx.store
        .add_shard(MODEL, "a", ShardRecord::new().with_dependencies(["b"]))
        .unwrap();
    fx.store
        .add_shard(MODEL, "b", ShardRecord::new().with_dependencies(["a"]))
        .unwrap();

    let err = manager
        .get_loading_sequence(Some(&["a".to_string()]))
        .unwrap_err();
    assert!(matches!(err, ShardError::DependencyCycle { .. }));
    assert!(err.is_structural());
    assert!(manager.load_shard("a", true).is_err());
    assert_eq!(manager.monitor().unwrap().stats().total_loads, 0);
}

#[test]
fn test_hot_switch_keeps_resident_shards() {
    let fx = create_fixture();
    let manager = fx.open();
    manager.load_shard("s3", true).unwrap();
    let loads_before = manager.monitor().unwrap().stats().total_loads;

    for name in ["LFU", "FIFO", "Weight-Aware", "freq_aware", "lru"] {
        let evicted = manager.switch_cache_strategy(name).unwrap();
        assert!(evicted.is_empty(), "{} evicted {:?}", name, evicted);
        let mut cached = manager.cached_shards();
        cached.sort();
        assert_eq!(cached, vec!["s1", "s2", "s3"]);
    }
    assert_eq!(manager.strategy().current_strategy(), Some(PolicyKind::Lru));

    manager.load_shard("s3", true).unwrap();
    assert_eq!(manager.monitor().unwrap().stats().total_loads, loads_before);
    assert!(matches!(
        manager.switch_cache_strategy("ARC"),
        Err(ShardError::UnknownStrategy { .. })
    ));
}

#[test]
fn test_hash_mismatch_leaves_metadata_untouched() {
    let fx = create_fixture();
    let checker = IntegrityChecker::new(fx.store.clone(), fx.shard_dir());
    let before = fx.stored_hash("s1");

    fs::write(fx.shard_dir().join("s1.bin"), b"GGUF tampered").unwrap();
    let err = checker
        .verify_shard(MODEL, "s1", VerificationLevel::Hash, false)
        .unwrap_err();
    assert!(matches!(err, ShardError::HashMismatch { .. }));
    assert_eq!(fx.stored_hash("s1"), before);

    let report = checker
        .verify_shard(MODEL, "s1", VerificationLevel::Hash, true)
        .unwrap();
    assert!(report.hash_updated);
    assert_eq!(fx.stored_hash("s1"), Some(sha256_hex(b"GGUF tampered")));
}

#[test]
fn test_recovery_repairs_tampered_shard() {
    init_tracing();
    let mut fx = create_fixture();
    fx.config = fx.config.clone().with_integrity(IntegrityConfig {
        verify_on_load: true,
        ..IntegrityConfig::default()
    });
    let manager = fx.open();

    fs::write(fx.shard_dir().join("s2.bin"), b"GGUF rewritten").unwrap();
    let shard = manager.load_shard("s2", false).unwrap().unwrap();
    assert_eq!(shard.bytes, b"GGUF rewritten");

    let expected = sha256_hex(b"GGUF rewritten");
    assert_eq!(fx.stored_hash("s2"), Some(expected.clone()));

    let recovery = manager.recovery().unwrap();
    let history = recovery.history();
    let last = history.last().unwrap();
    assert_eq!(last.action, RecoveryAction::Repair);
    assert!(last.success);
    assert!(history.iter().any(|r| r.action == RecoveryAction::Retry && !r.success));
    assert_eq!(recovery.failure_count("s2"), 0);

    // Repair is idempotent.
    assert_eq!(recovery.repair_hash("s2").unwrap(), expected);
    assert_eq!(fx.stored_hash("s2"), Some(expected));
}

#[test]
fn test_recovery_exhaustion_is_reported() {
    let mut fx = create_fixture();
    fx.config = fx
        .config
        .clone()
        .with_recovery(RecoveryConfig::default().with_strategy(RecoveryStrategy::FailFast));
    let manager = fx.open();

    fs::remove_file(fx.shard_dir().join("s1.bin")).unwrap();
    let err = manager.load_shard("s1", false).unwrap_err();
    assert!(matches!(err, ShardError::RecoveryExhausted { attempts: 2, .. }));
    assert!(!manager.is_cached("s1"));

    let err = manager.load_shard("s3", true).unwrap_err();
    assert!(matches!(
        err,
        ShardError::DependencyUnavailable { ref dependency, .. } if dependency == "s1"
    ));

    let stats = manager.recovery().unwrap().recovery_stats();
    assert_eq!(stats.total_failures, 2);
    assert_eq!(stats.recovered, 0);
    assert_eq!(stats.most_problematic_shards[0], ("s1".to_string(), 2));

    let monitor = manager.monitor().unwrap();
    assert_eq!(monitor.stats().failed_loads, 2);
    assert!(monitor
        .suggestions()
        .iter()
        .any(|s| s.kind == SuggestionKind::FixFailures && s.shards == vec!["s1"]));
}

#[test]
fn test_backups_restore_deleted_shard() {
    let fx = create_fixture();
    let manager = fx.open();
    let recovery = manager.recovery().unwrap();

    let results = recovery.backup_all_shards().unwrap();
    assert!(results.values().all(|ok| *ok));
    assert!(recovery.backup_path("s1").is_file());

    fs::remove_file(fx.shard_dir().join("s1.bin")).unwrap();
    let shard = manager.load_shard("s1", false).unwrap().unwrap();
    assert_eq!(shard.bytes, b"GGUF shard s1");
    assert!(recovery
        .history()
        .iter()
        .any(|r| r.action == RecoveryAction::UseBackup && r.success));
}

#[test]
fn test_monitor_suggests_preload_and_merge() {
    let fx = create_fixture();
    let mut config = fx.config.clone();
    config.monitor = config.monitor.with_hot_threshold(2);
    let manager = ShardManager::open_with_store(MODEL, fx.store.clone(), &config).unwrap();

    for _ in 0..3 {
        manager.load_shard("s3", true).unwrap();
        assert!(manager.clear_cache().is_complete());
    }

    let monitor = manager.monitor().unwrap();
    let hot: Vec<String> = monitor.hot_shards(10).into_iter().map(|(id, _)| id).collect();
    assert_eq!(hot.len(), 3);

    let suggestions = monitor.suggestions();
    assert!(suggestions.iter().any(|s| s.kind == SuggestionKind::Preload));
    let merge: Vec<&String> = suggestions
        .iter()
        .filter(|s| s.kind == SuggestionKind::Merge)
        .flat_map(|s| s.shards.iter())
        .collect();
    assert!(merge.contains(&&"s1".to_string()));
    assert!(merge.contains(&&"s2".to_string()));
    assert!(!merge.contains(&&"s3".to_string()));
}
