//! Preloader, memory-pressure unloading and concurrent loads sharing one
//! manager.

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shardkeep_core::{
    FnSource, LoadedShard, MetadataStore, MonitorConfig, PolicyConfig, PolicyKind,
    PreloadStrategy, Preloader, PreloaderConfig, PreloaderState, ShardError, ShardManager,
    ShardMonitor, ShardRecord, ShardResult, StaticProbe, StrategyConfig, UnloadConfig,
    UnloadStrategy,
};

type Manager = ShardManager<Arc<LoadedShard>>;
type LoadCounts = Arc<Mutex<HashMap<String, usize>>>;

const GIB: u64 = 1024 * 1024 * 1024;

/// `shard_00 <- shard_01 <- ... <- shard_{n-1}`, loads counted per id and
/// slowed by `delay`.
fn create_test_manager(n: usize, capacity: usize, delay: Duration) -> (Arc<Manager>, LoadCounts) {
    let store = Arc::new(MetadataStore::in_memory());
    for i in 0..n {
        let mut record = ShardRecord::new().with_layers([format!("layer.{}", i)]);
        if i > 0 {
            record = record.with_dependencies([format!("shard_{:02}", i - 1)]);
        }
        store
            .add_shard("chain", &format!("shard_{:02}", i), record)
            .unwrap();
    }

    let counts: LoadCounts = Arc::new(Mutex::new(HashMap::new()));
    let source_counts = counts.clone();
    let source = FnSource::new(move |id: &str| -> ShardResult<Option<Arc<LoadedShard>>> {
        *source_counts.lock().entry(id.to_string()).or_insert(0) += 1;
        thread::sleep(delay);
        Ok(Some(Arc::new(LoadedShard {
            shard_id: id.to_string(),
            layers: Vec::new(),
            bytes: vec![0; 16],
        })))
    });

    let manager: Manager = ShardManager::builder("chain", store, Arc::new(source))
        .with_strategy_config(
            StrategyConfig::default().with_global(PolicyConfig::new(PolicyKind::Lru, capacity)),
        )
        .with_probe(Arc::new(StaticProbe::new(5.0, 40.0, 8 * GIB)))
        .with_monitor(Arc::new(ShardMonitor::new(MonitorConfig::default())))
        .build()
        .unwrap();
    (Arc::new(manager), counts)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_concurrent_requests_load_each_shard_once() {
    let (manager, counts) = create_test_manager(4, 10, Duration::from_millis(20));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                manager.load_shard("shard_03", true)
            })
        })
        .collect();

    for handle in handles {
        let shard = handle.join().unwrap().unwrap().unwrap();
        assert_eq!(shard.shard_id, "shard_03");
    }

    let counts = counts.lock();
    assert_eq!(counts.len(), 4);
    assert!(counts.values().all(|n| *n == 1), "duplicate loads: {:?}", *counts);
    assert_eq!(manager.monitor().unwrap().stats().total_loads, 4);
}

#[test]
fn test_concurrent_independent_loads_respect_capacity() {
    let (manager, _counts) = create_test_manager(8, 3, Duration::from_millis(2));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = manager.clone();
            thread::spawn(move || manager.preload_shard(&format!("shard_{:02}", i)))
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().unwrap());
    }

    let stats = manager.cache_stats();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.loads, 8);
    assert_eq!(stats.evictions, 5);
}

#[test]
fn test_preloader_state_machine_and_prefetch() {
    let (manager, counts) = create_test_manager(4, 10, Duration::ZERO);
    let probe = StaticProbe::new(5.0, 40.0, 8 * GIB);
    let preloader = Preloader::with_probe(
        manager.clone(),
        PreloaderConfig::default()
            .with_strategy(PreloadStrategy::Sequential)
            .with_check_interval(Duration::from_millis(5)),
        Arc::new(probe.clone()),
    );
    assert_eq!(preloader.state(), PreloaderState::Idle);

    manager.load_shard("shard_00", false).unwrap();
    preloader.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || manager.is_cached("shard_01")));

    // Paused: nothing further is fetched.
    assert!(preloader.pause());
    manager.load_shard("shard_01", false).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!manager.is_cached("shard_02"));

    // Resource gate: CPU above the limit blocks preloading while running.
    probe.set_cpu_percent(99.0);
    assert!(preloader.resume());
    thread::sleep(Duration::from_millis(50));
    assert!(!manager.is_cached("shard_02"));

    probe.set_cpu_percent(5.0);
    assert!(wait_until(Duration::from_secs(5), || manager.is_cached("shard_02")));

    assert!(preloader.stop());
    assert_eq!(preloader.state(), PreloaderState::Stopped);
    let stats = preloader.preload_stats();
    assert_eq!(stats.preloaded, vec!["shard_01", "shard_02"]);
    assert!(stats.preloading.is_empty());
    assert_eq!(counts.lock()["shard_01"], 1);
}

#[test]
fn test_unload_under_memory_pressure_spares_dependencies() {
    let (manager, _counts) = create_test_manager(6, 10, Duration::ZERO);
    manager.load_shard("shard_03", true).unwrap();
    manager.load_shard("shard_05", false).unwrap();

    let probe = StaticProbe::new(5.0, 70.0, 8 * GIB);
    let unloader = UnloadStrategy::with_probe(
        manager.clone(),
        UnloadConfig::default().with_threshold(80.0).with_min_cache_size(2),
        Arc::new(probe.clone()),
    );
    assert!(unloader.check_and_unload().unwrap().is_empty());

    // Full pressure over 5 cached asks for 3, but only shard_03 and
    // shard_05 have no cached dependents.
    probe.set_memory_percent(100.0);
    let released = unloader.check_and_unload().unwrap();
    assert_eq!(released, vec!["shard_03", "shard_05"]);

    let mut cached = manager.cached_shards();
    cached.sort();
    assert_eq!(cached, vec!["shard_00", "shard_01", "shard_02"]);
}

#[test]
fn test_recursive_load_reports_unavailable_dependency() -> anyhow::Result<()> {
    let store = Arc::new(MetadataStore::in_memory());
    store.add_shard("m", "base", ShardRecord::new())?;
    store.add_shard("m", "top", ShardRecord::new().with_dependencies(["base"]))?;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let source_calls = calls.clone();
    let source = FnSource::new(move |id: &str| -> ShardResult<Option<Arc<LoadedShard>>> {
        source_calls.lock().push(id.to_string());
        Ok(None)
    });
    let manager: Manager = ShardManager::builder("m", store, Arc::new(source))
        .with_probe(Arc::new(StaticProbe::new(0.0, 0.0, 8 * GIB)))
        .build()?;

    let err = manager.load_shard("top", true).unwrap_err();
    assert!(matches!(err, ShardError::DependencyUnavailable { .. }));
    assert_eq!(*calls.lock(), vec!["base"]);
    assert!(manager.cached_shards().is_empty());
    Ok(())
}
