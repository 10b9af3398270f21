//! Per-model metadata registry with JSON persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ModelMetadata, ShardRecord};
use crate::digest;
use crate::error::{ShardError, ShardResult};
use crate::io;

const METADATA_SUFFIX: &str = "_metadata.json";

/// Registry of model metadata, optionally backed by a directory.
#[derive(Debug)]
pub struct MetadataStore {
    dir: Option<PathBuf>,
    models: RwLock<HashMap<String, ModelMetadata>>,
}

#[derive(Deserialize)]
struct ChecksumFile {
    #[serde(default)]
    checksums: Vec<String>,
}

impl MetadataStore {
    /// Store persisting to `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Store persisting to the default location.
    ///
    /// Default: `<cache dir>/shardkeep/metadata`
    pub fn with_default_dir() -> ShardResult<Self> {
        Ok(Self::new(io::default_metadata_dir_impl()?))
    }

    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn model_path(&self, model: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}{}", model, METADATA_SUFFIX)))
    }

    fn unknown(model: &str) -> ShardError {
        ShardError::UnknownModel {
            model: model.to_string(),
        }
    }

    /// Register (or replace) a model's metadata.
    pub fn insert(&self, metadata: ModelMetadata) {
        self.models
            .write()
            .insert(metadata.model_name.clone(), metadata);
    }

    /// Create empty metadata for a model unless it already exists.
    pub fn create_model(&self, model: &str) {
        self.models
            .write()
            .entry(model.to_string())
            .or_insert_with(|| ModelMetadata::new(model));
    }

    pub fn contains_model(&self, model: &str) -> bool {
        self.models.read().contains_key(model)
    }

    /// Run `f` against a model's metadata, loading it from disk on first use.
    pub fn with_model<R>(&self, model: &str, f: impl FnOnce(&ModelMetadata) -> R) -> ShardResult<R> {
        if !self.contains_model(model) {
            self.load(model)?;
        }
        let models = self.models.read();
        let meta = models.get(model).ok_or_else(|| Self::unknown(model))?;
        Ok(f(meta))
    }

    /// Run `f` against a model's metadata mutably.
    ///
    /// Changes stay in memory until [`save`](Self::save) is called.
    pub fn with_model_mut<R>(
        &self,
        model: &str,
        f: impl FnOnce(&mut ModelMetadata) -> R,
    ) -> ShardResult<R> {
        if !self.contains_model(model) {
            self.load(model)?;
        }
        let mut models = self.models.write();
        let meta = models.get_mut(model).ok_or_else(|| Self::unknown(model))?;
        Ok(f(meta))
    }

    /// Clone of a model's metadata.
    pub fn snapshot(&self, model: &str) -> ShardResult<ModelMetadata> {
        self.with_model(model, Clone::clone)
    }

    pub fn add_shard(&self, model: &str, shard_id: &str, record: ShardRecord) -> ShardResult<()> {
        self.create_model_if_absent(model)?;
        self.with_model_mut(model, |meta| meta.add_shard(shard_id, record))
    }

    pub fn update_shard<F>(&self, model: &str, shard_id: &str, update: F) -> ShardResult<()>
    where
        F: FnOnce(&mut ShardRecord),
    {
        self.with_model_mut(model, |meta| meta.update_shard(shard_id, update))?
    }

    pub fn remove_shard(&self, model: &str, shard_id: &str) -> ShardResult<Option<ShardRecord>> {
        self.with_model_mut(model, |meta| meta.remove_shard(shard_id))
    }

    pub fn shard(&self, model: &str, shard_id: &str) -> ShardResult<ShardRecord> {
        self.with_model(model, |meta| meta.require_shard(shard_id).cloned())?
    }

    fn create_model_if_absent(&self, model: &str) -> ShardResult<()> {
        if self.contains_model(model) {
            return Ok(());
        }
        match self.load(model) {
            Ok(()) => Ok(()),
            Err(ShardError::UnknownModel { .. }) => {
                self.create_model(model);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Persist a model's metadata. No-op for in-memory stores.
    pub fn save(&self, model: &str) -> ShardResult<()> {
        let Some(path) = self.model_path(model) else {
            return Ok(());
        };
        let models = self.models.read();
        let meta = models.get(model).ok_or_else(|| Self::unknown(model))?;
        io::write_json_atomic(&path, meta)?;
        debug!(model, path = %path.display(), shards = meta.len(), "saved metadata");
        Ok(())
    }

    /// Read a model's metadata from disk, replacing the in-memory copy.
    pub fn load(&self, model: &str) -> ShardResult<()> {
        let path = self.model_path(model).ok_or_else(|| Self::unknown(model))?;
        if !path.exists() {
            return Err(Self::unknown(model));
        }
        let content = fs::read_to_string(&path).map_err(|e| ShardError::Metadata {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let meta: ModelMetadata = serde_json::from_str(&content).map_err(|e| ShardError::Metadata {
            message: format!("failed to parse {}: {}", path.display(), e),
        })?;

        let missing = meta.verify_dependencies();
        if !missing.is_empty() {
            warn!(model, ?missing, "metadata references missing dependencies");
        }

        self.models.write().insert(model.to_string(), meta);
        Ok(())
    }

    /// Models known in memory or on disk, sorted.
    pub fn list_models(&self) -> ShardResult<Vec<String>> {
        let mut models: Vec<String> = self.models.read().keys().cloned().collect();

        if let Some(dir) = &self.dir {
            if dir.is_dir() {
                for entry in fs::read_dir(dir)? {
                    let name = entry?.file_name();
                    let name = name.to_string_lossy();
                    if let Some(model) = name.strip_suffix(METADATA_SUFFIX) {
                        if !models.iter().any(|m| m == model) {
                            models.push(model.to_string());
                        }
                    }
                }
            }
        }

        models.sort();
        Ok(models)
    }

    /// Forget a model and delete its file. Returns whether anything was removed.
    pub fn delete_model(&self, model: &str) -> ShardResult<bool> {
        let mut removed = self.models.write().remove(model).is_some();
        if let Some(path) = self.model_path(model) {
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }
        if removed {
            info!(model, "deleted metadata");
        }
        Ok(removed)
    }

    /// Build metadata from a directory of `*_part_*.bin` files.
    ///
    /// Shards are named `shard_000`, `shard_001`, ... in file-name order and
    /// each depends on its predecessor. Hashes come from `checksums.json`
    /// (`{"checksums": [...]}`) when present, otherwise they are computed.
    pub fn generate_from_shards(&self, model: &str, shard_dir: &Path) -> ShardResult<ModelMetadata> {
        let mut files: Vec<PathBuf> = fs::read_dir(shard_dir)
            .map_err(|e| ShardError::Io {
                message: format!("failed to read {}: {}", shard_dir.display(), e),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.contains("_part_") && n.ends_with(".bin"))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(ShardError::Metadata {
                message: format!("no shard files found in {}", shard_dir.display()),
            });
        }

        let checksums = read_checksums(&shard_dir.join("checksums.json"));

        let mut meta = ModelMetadata::new(model);
        let mut previous: Option<String> = None;
        for (i, path) in files.iter().enumerate() {
            let shard_id = format!("shard_{:03}", i);
            let size = fs::metadata(path)?.len();
            let hash = match checksums.get(i) {
                Some(sum) => sum.clone(),
                None => digest::sha256_file(path)?,
            };

            let mut record = ShardRecord::new()
                .with_path(path.clone())
                .with_size(size)
                .with_hash(hash);
            if let Some(prev) = previous.take() {
                record = record.with_dependencies([prev]);
            }
            meta.add_shard(shard_id.clone(), record);
            previous = Some(shard_id);
        }

        info!(model, shards = meta.len(), dir = %shard_dir.display(), "generated metadata");
        self.insert(meta.clone());
        self.save(model)?;
        Ok(meta)
    }
}

fn read_checksums(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str::<ChecksumFile>(&content) {
        Ok(file) => file.checksums,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable checksums file");
            Vec::new()
        }
    }
}
