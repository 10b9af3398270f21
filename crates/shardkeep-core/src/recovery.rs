//! Load failure recovery.
//!
//! [`RecoveryManager`] sits in the load pipeline at
//! [`InterceptorStage::Recover`], inside the monitor. When the inner load
//! fails or produces nothing it classifies the failure, plans an ordered list
//! of [`RecoveryAction`]s from the configured [`RecoveryStrategy`], and runs
//! them until one yields a payload.
//!
//! ```text
//! Strategy       Actions
//! MINIMAL        RETRY while retries remain, else NOTIFY SKIP
//! FAILFAST       NOTIFY SKIP
//! CONSERVATIVE   [RETRY] USE_BACKUP [REDOWNLOAD] [REPAIR] NOTIFY SKIP
//! AGGRESSIVE     [RETRY] <type-ordered REDOWNLOAD/USE_BACKUP/REPAIR> NOTIFY FALLBACK SKIP
//! ```
//!
//! Structural errors (missing dependency, cycle) pass through untouched.
//! Every attempted action is recorded; running out of actions surfaces
//! [`ShardError::RecoveryExhausted`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::digest;
use crate::error::{ShardError, ShardResult};
use crate::integrity::IntegrityChecker;
use crate::pipeline::{InterceptorStage, LoadInterceptor, LoadNext};

const HISTORY_LIMIT: usize = 1000;
const BACKUP_SUFFIX: &str = "_backup.bin";
const TEMP_BACKUP_EXT: &str = "temp_backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    UseBackup,
    Redownload,
    Repair,
    Notify,
    Skip,
    Fallback,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retry => "retry",
            Self::UseBackup => "use_backup",
            Self::Redownload => "redownload",
            Self::Repair => "repair",
            Self::Notify => "notify",
            Self::Skip => "skip",
            Self::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    IoError,
    Corruption,
    HashMismatch,
    MissingFile,
    SignatureError,
    FormatError,
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IoError => "io_error",
            Self::Corruption => "corruption",
            Self::HashMismatch => "hash_mismatch",
            Self::MissingFile => "missing_file",
            Self::SignatureError => "signature_error",
            Self::FormatError => "format_error",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Conservative,
    Aggressive,
    Minimal,
    #[serde(alias = "fail_fast")]
    FailFast,
}

impl std::str::FromStr for RecoveryStrategy {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "conservative" => Ok(Self::Conservative),
            "aggressive" => Ok(Self::Aggressive),
            "minimal" => Ok(Self::Minimal),
            "failfast" => Ok(Self::FailFast),
            other => Err(ShardError::Config {
                message: format!("unknown recovery strategy: {}", other),
            }),
        }
    }
}

/// Recovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub strategy: RecoveryStrategy,
    /// Failures of one shard after which RETRY is no longer planned.
    pub max_retries: usize,
    pub enable_repair: bool,
    pub enable_notifications: bool,
    /// Defaults to `<shard_dir>/../backups`.
    pub backup_dir: Option<PathBuf>,
    /// Base of the exponential retry delay.
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategy::Conservative,
            max_retries: 3,
            enable_repair: true,
            enable_notifications: true,
            backup_dir: None,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
        }
    }
}

impl RecoveryConfig {
    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_ms = base.as_millis() as u64;
        self.retry_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_repair(mut self, enabled: bool) -> Self {
        self.enable_repair = enabled;
        self
    }
}

/// One attempted recovery action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub shard_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: RecoveryAction,
    pub failure_type: FailureType,
    pub success: bool,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub total_failures: u64,
    pub recovered: usize,
    pub failed_recoveries: usize,
    pub action_counts: BTreeMap<RecoveryAction, u64>,
    pub shards_with_issues: usize,
    pub most_problematic_shards: Vec<(String, u64)>,
}

/// Re-fetches a shard file from an external origin.
pub trait ShardFetcher: Send + Sync {
    /// Write a fresh copy of `shard_id` to `dest`. `Ok(false)` means the
    /// origin has no copy.
    fn fetch(&self, shard_id: &str, dest: &Path) -> ShardResult<bool>;
}

/// Supplies a degraded substitute payload.
pub trait FallbackProvider<V>: Send + Sync {
    fn fallback(&self, shard_id: &str) -> Option<V>;
}

pub type Notifier = Arc<dyn Fn(&str) + Send + Sync>;

/// Action list for a failure, in execution order.
pub fn plan_actions(
    strategy: RecoveryStrategy,
    failure_type: FailureType,
    exhausted_retries: bool,
    enable_repair: bool,
) -> Vec<RecoveryAction> {
    use RecoveryAction::*;

    let mut actions = Vec::new();
    match strategy {
        RecoveryStrategy::Minimal => {
            if exhausted_retries {
                actions.extend([Notify, Skip]);
            } else {
                actions.push(Retry);
            }
        }
        RecoveryStrategy::FailFast => actions.extend([Notify, Skip]),
        RecoveryStrategy::Conservative => {
            if !exhausted_retries {
                actions.push(Retry);
            }
            actions.push(UseBackup);
            if matches!(
                failure_type,
                FailureType::MissingFile | FailureType::Corruption | FailureType::HashMismatch
            ) {
                actions.push(Redownload);
            }
            if enable_repair {
                actions.push(Repair);
            }
            actions.extend([Notify, Skip]);
        }
        RecoveryStrategy::Aggressive => {
            if !exhausted_retries {
                actions.push(Retry);
            }
            match failure_type {
                FailureType::HashMismatch => actions.extend([Redownload, UseBackup, Repair]),
                FailureType::MissingFile => actions.extend([Redownload, UseBackup]),
                FailureType::Corruption => actions.extend([Repair, UseBackup, Redownload]),
                _ => actions.extend([UseBackup, Redownload, Repair]),
            }
            actions.extend([Notify, Fallback, Skip]);
        }
    }
    actions
}

/// Classify from the error alone. Variants map directly; other errors fall
/// back to message keywords.
fn classify_error(error: &ShardError) -> Option<FailureType> {
    match error {
        ShardError::HashMismatch { .. } => return Some(FailureType::HashMismatch),
        ShardError::Signature { .. } => return Some(FailureType::SignatureError),
        ShardError::Header { .. } => return Some(FailureType::FormatError),
        ShardError::MissingFile { .. } => return Some(FailureType::MissingFile),
        _ => {}
    }

    let message = error.to_string().to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| message.contains(w));
    if has(&["permission", "access"]) {
        Some(FailureType::IoError)
    } else if has(&["corrupt", "invalid"]) {
        Some(FailureType::Corruption)
    } else if has(&["hash", "checksum"]) {
        Some(FailureType::HashMismatch)
    } else if has(&["signature"]) {
        Some(FailureType::SignatureError)
    } else if has(&["format", "header"]) {
        Some(FailureType::FormatError)
    } else if matches!(error, ShardError::Io { .. }) {
        Some(FailureType::IoError)
    } else {
        None
    }
}

fn backoff_delay(base_ms: u64, max_ms: u64, attempt: usize) -> Duration {
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let exp = attempt.saturating_sub(1).min(16) as u32;
    let capped = base_ms.saturating_mul(1 << exp).min(max_ms);
    let jittered = rand::thread_rng().gen_range(0..=capped);
    Duration::from_millis(jittered.max(10))
}

#[derive(Debug, Default)]
struct RecoveryState {
    failure_counts: HashMap<String, usize>,
    failures_by_shard: HashMap<String, u64>,
    total_failures: u64,
    action_counts: BTreeMap<RecoveryAction, u64>,
    history: VecDeque<FailureRecord>,
}

/// Removes a shard from the recovering set when dropped.
struct RecoveringGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    shard_id: String,
}

impl Drop for RecoveringGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.shard_id);
    }
}

/// Failure classification and action pipeline for one model.
pub struct RecoveryManager<V> {
    model: String,
    checker: Arc<IntegrityChecker>,
    config: RecoveryConfig,
    backup_dir: PathBuf,
    fetcher: Option<Arc<dyn ShardFetcher>>,
    fallback: Option<Arc<dyn FallbackProvider<V>>>,
    notifier: Option<Notifier>,
    state: Mutex<RecoveryState>,
    recovering: Mutex<HashSet<String>>,
}

impl<V> fmt::Debug for RecoveryManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("model", &self.model)
            .field("strategy", &self.config.strategy)
            .field("backup_dir", &self.backup_dir)
            .field("has_fetcher", &self.fetcher.is_some())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<V> RecoveryManager<V> {
    pub fn new(model: impl Into<String>, checker: Arc<IntegrityChecker>, config: RecoveryConfig) -> Self {
        let backup_dir = config.backup_dir.clone().unwrap_or_else(|| {
            checker
                .base_dir()
                .parent()
                .unwrap_or_else(|| checker.base_dir())
                .join("backups")
        });
        Self {
            model: model.into(),
            checker,
            config,
            backup_dir,
            fetcher: None,
            fallback: None,
            notifier: None,
            state: Mutex::new(RecoveryState::default()),
            recovering: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ShardFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackProvider<V>>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn backup_path(&self, shard_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{}{}", shard_id, BACKUP_SUFFIX))
    }

    fn notify(&self, message: &str) {
        if !self.config.enable_notifications {
            return;
        }
        warn!(model = %self.model, notification = message, "recovery notification");
        if let Some(notifier) = &self.notifier {
            notifier(message);
        }
    }

    /// Failure type from file state, an integrity probe and the error.
    pub fn classify(&self, shard_id: &str, error: Option<&ShardError>) -> FailureType {
        let Ok(path) = self.checker.path_of(&self.model, shard_id) else {
            return FailureType::Unknown;
        };
        if !path.exists() {
            return FailureType::MissingFile;
        }

        let level = self.checker.config().level;
        match self.checker.verify_shard(&self.model, shard_id, level, false) {
            Err(ShardError::HashMismatch { .. }) => return FailureType::HashMismatch,
            Err(ShardError::Signature { .. }) => return FailureType::SignatureError,
            Err(ShardError::Header { .. }) => return FailureType::FormatError,
            Err(ShardError::MissingFile { .. }) => return FailureType::MissingFile,
            Err(e) => debug!(shard_id, error = %e, "integrity probe inconclusive"),
            Ok(_) => {}
        }

        error.and_then(classify_error).unwrap_or(FailureType::Unknown)
    }

    /// Copy a shard file into the backup directory.
    pub fn create_backup(&self, shard_id: &str) -> ShardResult<PathBuf> {
        let source = self.checker.path_of(&self.model, shard_id)?;
        if !source.is_file() {
            return Err(ShardError::MissingFile {
                shard_id: shard_id.to_string(),
                path: source,
            });
        }
        fs::create_dir_all(&self.backup_dir)?;
        let backup = self.backup_path(shard_id);
        fs::copy(&source, &backup)?;
        info!(shard_id, backup = %backup.display(), "created shard backup");
        Ok(backup)
    }

    /// Copy the backup over the shard file. `Ok(false)` when no backup exists.
    pub fn restore_from_backup(&self, shard_id: &str) -> ShardResult<bool> {
        let backup = self.backup_path(shard_id);
        if !backup.is_file() {
            return Ok(false);
        }
        let dest = self.checker.path_of(&self.model, shard_id)?;
        copy_into_place(&backup, &dest)?;
        info!(shard_id, "restored shard from backup");
        Ok(true)
    }

    /// Back up every shard of the model, reporting per-shard success.
    pub fn backup_all_shards(&self) -> ShardResult<BTreeMap<String, bool>> {
        let ids = self
            .checker
            .store()
            .with_model(&self.model, |meta| meta.shard_ids())?;
        let results: BTreeMap<String, bool> = ids
            .into_iter()
            .map(|id| {
                let ok = match self.create_backup(&id) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(shard_id = %id, error = %e, "backup failed");
                        false
                    }
                };
                (id, ok)
            })
            .collect();
        let succeeded = results.values().filter(|ok| **ok).count();
        info!(model = %self.model, succeeded, failed = results.len() - succeeded, "backed up shards");
        Ok(results)
    }

    pub fn failure_count(&self, shard_id: &str) -> usize {
        self.state
            .lock()
            .failure_counts
            .get(shard_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_recovering(&self, shard_id: &str) -> bool {
        self.recovering.lock().contains(shard_id)
    }

    pub fn history(&self) -> Vec<FailureRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        let state = self.state.lock();
        let recovered = state.history.iter().filter(|r| r.success).count();
        let mut problematic: Vec<(String, u64)> = state
            .failures_by_shard
            .iter()
            .map(|(id, n)| (id.clone(), *n))
            .collect();
        problematic.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        problematic.truncate(5);
        RecoveryStats {
            total_failures: state.total_failures,
            recovered,
            failed_recoveries: state.history.len() - recovered,
            action_counts: state.action_counts.clone(),
            shards_with_issues: state.failures_by_shard.len(),
            most_problematic_shards: problematic,
        }
    }

    fn record(&self, record: FailureRecord) {
        let mut state = self.state.lock();
        *state.action_counts.entry(record.action).or_default() += 1;
        if state.history.len() >= HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(record);
    }

    /// Run the recovery pipeline for a failed load of `shard_id`.
    ///
    /// `next` is the load path below the recovery stage. A shard already
    /// being recovered is rejected with [`ShardError::RecoveryInProgress`].
    pub fn recover(
        &self,
        shard_id: &str,
        error: Option<&ShardError>,
        next: LoadNext<'_, V>,
    ) -> ShardResult<Option<V>> {
        if !self.recovering.lock().insert(shard_id.to_string()) {
            warn!(shard_id, "recovery already in progress");
            return Err(ShardError::RecoveryInProgress {
                shard_id: shard_id.to_string(),
            });
        }
        let _guard = RecoveringGuard {
            set: &self.recovering,
            shard_id: shard_id.to_string(),
        };

        let failure_count = {
            let mut state = self.state.lock();
            state.total_failures += 1;
            *state.failures_by_shard.entry(shard_id.to_string()).or_default() += 1;
            let count = state.failure_counts.entry(shard_id.to_string()).or_default();
            *count += 1;
            *count
        };

        let failure_type = self.classify(shard_id, error);
        let exhausted = failure_count > self.config.max_retries;
        let actions = plan_actions(
            self.config.strategy,
            failure_type,
            exhausted,
            self.config.enable_repair,
        );
        info!(
            shard_id,
            failure_type = %failure_type,
            failure_count,
            actions = ?actions,
            "recovering shard"
        );

        let started = Instant::now();
        for action in &actions {
            debug!(shard_id, action = %action, "attempting recovery action");
            let payload = self.execute(shard_id, *action, failure_type, failure_count, next);
            let success = payload.is_some();
            self.record(FailureRecord {
                shard_id: shard_id.to_string(),
                timestamp: Utc::now(),
                action: *action,
                failure_type,
                success,
                duration_secs: started.elapsed().as_secs_f64(),
            });
            if let Some(payload) = payload {
                self.state.lock().failure_counts.insert(shard_id.to_string(), 0);
                info!(shard_id, action = %action, "recovered shard");
                return Ok(Some(payload));
            }
        }

        error!(shard_id, attempts = actions.len(), "all recovery actions failed");
        self.notify(&format!(
            "recovery failed for shard {} after {} action(s)",
            shard_id,
            actions.len()
        ));
        Err(ShardError::RecoveryExhausted {
            shard_id: shard_id.to_string(),
            attempts: actions.len(),
        })
    }

    fn execute(
        &self,
        shard_id: &str,
        action: RecoveryAction,
        failure_type: FailureType,
        failure_count: usize,
        next: LoadNext<'_, V>,
    ) -> Option<V> {
        match action {
            RecoveryAction::Retry => {
                let delay = backoff_delay(
                    self.config.retry_base_ms,
                    self.config.retry_max_ms,
                    failure_count,
                );
                if !delay.is_zero() {
                    debug!(shard_id, backoff_ms = delay.as_millis() as u64, "backing off before retry");
                    thread::sleep(delay);
                }
                self.reload(shard_id, next)
            }
            RecoveryAction::UseBackup => match self.restore_from_backup(shard_id) {
                Ok(true) => self.reload(shard_id, next),
                Ok(false) => {
                    debug!(shard_id, "no backup available");
                    None
                }
                Err(e) => {
                    warn!(shard_id, error = %e, "restoring backup failed");
                    None
                }
            },
            RecoveryAction::Redownload => self.redownload(shard_id, next),
            RecoveryAction::Repair => self.repair(shard_id, failure_type, next),
            RecoveryAction::Notify => {
                self.notify(&format!("shard {} failed to load ({})", shard_id, failure_type));
                None
            }
            RecoveryAction::Fallback => self.fallback.as_ref().and_then(|f| f.fallback(shard_id)),
            RecoveryAction::Skip => {
                warn!(shard_id, "skipping shard");
                None
            }
        }
    }

    fn reload(&self, shard_id: &str, next: LoadNext<'_, V>) -> Option<V> {
        match next(shard_id) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(shard_id, error = %e, "reload failed");
                None
            }
        }
    }

    fn redownload(&self, shard_id: &str, next: LoadNext<'_, V>) -> Option<V> {
        let path = match self.checker.path_of(&self.model, shard_id) {
            Ok(path) => path,
            Err(e) => {
                warn!(shard_id, error = %e, "cannot resolve shard path");
                return None;
            }
        };

        let mut temp = path.clone().into_os_string();
        temp.push(".");
        temp.push(TEMP_BACKUP_EXT);
        let temp = PathBuf::from(temp);
        if temp.is_file() {
            match copy_into_place(&temp, &path) {
                Ok(()) => {
                    info!(shard_id, "restored shard from temporary backup");
                    if let Some(payload) = self.reload(shard_id, next) {
                        return Some(payload);
                    }
                }
                Err(e) => warn!(shard_id, error = %e, "restoring temporary backup failed"),
            }
        }

        if let Some(fetcher) = &self.fetcher {
            match fetcher.fetch(shard_id, &path) {
                Ok(true) => return self.reload(shard_id, next),
                Ok(false) => debug!(shard_id, "origin has no copy"),
                Err(e) => warn!(shard_id, error = %e, "fetch failed"),
            }
        }

        self.notify(&format!("shard {} needs to be re-downloaded", shard_id));
        None
    }

    /// Only hash mismatches are repairable: the current file hash becomes the
    /// stored hash. Repeating the repair leaves the stored hash unchanged.
    fn repair(&self, shard_id: &str, failure_type: FailureType, next: LoadNext<'_, V>) -> Option<V> {
        if failure_type != FailureType::HashMismatch {
            warn!(shard_id, failure_type = %failure_type, "no repair available for failure type");
            return None;
        }
        match self.repair_hash(shard_id) {
            Ok(hash) => {
                info!(shard_id, hash = %hash, "repaired stored hash");
                self.reload(shard_id, next)
            }
            Err(e) => {
                warn!(shard_id, error = %e, "hash repair failed");
                None
            }
        }
    }

    /// Store the current file hash for `shard_id` and return it.
    pub fn repair_hash(&self, shard_id: &str) -> ShardResult<String> {
        let path = self.checker.path_of(&self.model, shard_id)?;
        let hash = digest::sha256_file(&path)?;
        let store = self.checker.store();
        let stored = hash.clone();
        store.update_shard(&self.model, shard_id, |r| r.hash = Some(stored))?;
        store.save(&self.model)?;
        Ok(hash)
    }
}

fn copy_into_place(from: &Path, to: &Path) -> ShardResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    Ok(())
}

impl<V: Send + Sync> LoadInterceptor<V> for RecoveryManager<V> {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn stage(&self) -> InterceptorStage {
        InterceptorStage::Recover
    }

    fn around_load(&self, shard_id: &str, next: LoadNext<'_, V>) -> ShardResult<Option<V>> {
        match next(shard_id) {
            Ok(Some(payload)) => {
                if let Some(count) = self.state.lock().failure_counts.get_mut(shard_id) {
                    *count = 0;
                }
                Ok(Some(payload))
            }
            Ok(None) => {
                warn!(shard_id, "load produced nothing");
                self.recover(shard_id, None, next)
            }
            Err(e) if e.is_structural() => Err(e),
            Err(e) => {
                warn!(shard_id, error = %e, "load failed");
                self.recover(shard_id, Some(&e), next)
            }
        }
    }
}
