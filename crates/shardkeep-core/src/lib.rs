//! Shard cache and lifecycle management for partitioned model weights.
//!
//! A model split into shards is described by per-model metadata (layers,
//! dependencies, path, size, hash, signature). This crate keeps a bounded set
//! of those shards resident:
//!
//! - Metadata store with dependency validation and topological load order
//! - Five interchangeable cache policies (LRU, LFU, FIFO, Weight-Aware,
//!   Freq-Aware) with hot switching driven by host memory tiers
//! - Dependency-ordered loading through a monitor and recovery pipeline
//! - SHA-256 hashes, HMAC-SHA256 signatures and header checks
//! - Predictive background preloading and memory-pressure unloading
//!
//! # Quick Start
//!
//! ```no_run
//! use shardkeep_core::{ShardConfig, ShardManager};
//!
//! # fn example() -> shardkeep_core::ShardResult<()> {
//! let config = ShardConfig::from_env().with_shard_dir("/models/llama/shards");
//! let manager = ShardManager::open("llama", &config)?;
//!
//! if let Some(shard) = manager.load_shard("shard_003", true)? {
//!     println!("{} bytes, layers {:?}", shard.len(), shard.layers);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `SHARDKEEP_SHARD_DIR` | Directory shard paths are resolved against (default: `shards`) |
//! | `SHARDKEEP_METADATA_DIR` | Metadata directory (default: `<cache>/shardkeep/metadata`) |
//! | `SHARDKEEP_CACHE_STRATEGY` | Global cache policy (default: `LRU`) |
//! | `SHARDKEEP_CACHE_CAPACITY` | Global cache capacity in shards (default: 5) |
//! | `SHARDKEEP_VERIFY_LEVEL` | `basic`, `hash`, `signature` or `full` (default: `hash`) |
//! | `SHARDKEEP_RECOVERY_STRATEGY` | `conservative`, `aggressive`, `minimal` or `failfast` |
//! | `SHARDKEEP_MAX_RETRIES` | Retries before RETRY is dropped from recovery plans (default: 3) |
//! | `SHARDKEEP_MEMORY_THRESHOLD` | Memory percentage that triggers unloading (default: 85) |
//! | `SHARDKEEP_SIGNING_KEYS` | Trusted HMAC keys, `id=secret,id2=secret2` |

pub mod cache;
pub mod clock;
pub mod config;
mod digest;
pub mod error;
pub mod integrity;
mod io;
pub mod keyring;
pub mod manager;
pub mod metadata;
pub mod monitor;
pub mod pipeline;
pub mod policy;
pub mod preloader;
pub mod recovery;
pub mod source;
pub mod strategy;
pub mod telemetry;
pub mod unload;
pub mod worker;

// Re-export main types
pub use cache::{CacheStats, ClearReport, ShardCache};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use config::ShardConfig;
pub use error::{ShardError, ShardResult};
pub use integrity::{
    DependencyIntegrityReport, IntegrityChecker, IntegrityConfig, ShardFormat, ShardVerification,
    VerificationLevel, VerificationStatus, VerifyReport,
};
pub use keyring::KeyRing;
pub use manager::{AccessListener, ShardManager, ShardManagerBuilder};
pub use metadata::{MetadataStore, ModelMetadata, ShardRecord};
pub use monitor::{
    LoadStatus, MonitorConfig, MonitorStats, ShardMonitor, Suggestion, SuggestionKind,
};
pub use pipeline::{FnSource, InterceptorStage, LoadInterceptor, LoadPipeline, ShardSource};
pub use policy::{AdmitOptions, CachePolicy, EntryStats, PolicyConfig, PolicyKind};
pub use preloader::{PreloadStats, PreloadStrategy, Preloader, PreloaderConfig, PreloaderState};
pub use recovery::{
    FailureType, FallbackProvider, RecoveryAction, RecoveryConfig, RecoveryManager,
    RecoveryStats, RecoveryStrategy, ShardFetcher,
};
pub use source::{FileShardSource, LoadedShard, ShardPayload};
pub use strategy::{MemoryTier, StrategyConfig, StrategyManager, TierThresholds};
pub use telemetry::{system_probe, ResourceProbe, StaticProbe, SysinfoProbe};
pub use unload::{UnloadConfig, UnloadMode, UnloadStrategy};
pub use worker::BackgroundWorker;
