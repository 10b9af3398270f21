//! Shard metadata: per-model records and the dependency graph.
//!
//! A [`ModelMetadata`] is the source of truth for which shards exist, the
//! layers each one carries and the dependency edges between them. The
//! [`MetadataStore`] owns one `ModelMetadata` per model and persists it as
//! JSON:
//!
//! ```text
//! <metadata_dir>/<model>_metadata.json
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest;
use crate::error::{ShardError, ShardResult};

pub(crate) mod epoch;
mod order;
mod store;

pub use store::MetadataStore;

/// Current metadata document version.
pub const METADATA_VERSION: f64 = 1.0;

/// One shard of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Layer names stored in this shard.
    #[serde(default)]
    pub layers: Vec<String>,

    /// Lowercase hex SHA-256 of the file contents.
    #[serde(default)]
    pub hash: Option<String>,

    /// Base64 HMAC-SHA256 over the file contents.
    #[serde(default)]
    pub signature: Option<String>,

    /// Trusted key used to produce `signature`.
    #[serde(default)]
    pub key_id: Option<String>,

    /// Shards that must be resident before this one is loaded.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// File location, absolute or relative to the shard directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub size_bytes: u64,

    #[serde(with = "epoch", default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "epoch", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ShardRecord {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            layers: Vec::new(),
            hash: None,
            signature: None,
            key_id: None,
            depends_on: Vec::new(),
            path: None,
            size_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for layer in layers {
            let layer = layer.into();
            if !self.layers.contains(&layer) {
                self.layers.push(layer);
            }
        }
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Resolve the record's path against a base directory.
    pub fn resolve_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                base_dir.join(p)
            }
        })
    }
}

impl Default for ShardRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// All shard records of one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,

    #[serde(default = "default_version")]
    pub version: f64,

    #[serde(with = "epoch", default = "Utc::now")]
    pub creation_time: DateTime<Utc>,

    #[serde(with = "epoch", default = "Utc::now")]
    pub last_modified: DateTime<Utc>,

    #[serde(default)]
    shards: BTreeMap<String, ShardRecord>,

    /// shard -> shards that list it in `depends_on`. Reset on structural change.
    #[serde(skip)]
    reverse: OnceLock<HashMap<String, BTreeSet<String>>>,
}

fn default_version() -> f64 {
    METADATA_VERSION
}

impl ModelMetadata {
    pub fn new(model_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            model_name: model_name.into(),
            version: METADATA_VERSION,
            creation_time: now,
            last_modified: now,
            shards: BTreeMap::new(),
            reverse: OnceLock::new(),
        }
    }

    fn touch(&mut self) {
        self.last_modified = Utc::now();
        self.reverse = OnceLock::new();
    }

    /// Add a shard, replacing any record with the same id.
    ///
    /// A replaced record keeps its original `created_at`.
    pub fn add_shard(&mut self, shard_id: impl Into<String>, mut record: ShardRecord) {
        let shard_id = shard_id.into();
        let now = Utc::now();
        if let Some(existing) = self.shards.get(&shard_id) {
            record.created_at = existing.created_at;
        }
        record.updated_at = now;
        self.shards.insert(shard_id, record);
        self.touch();
    }

    /// Mutate an existing shard record in place.
    pub fn update_shard<F>(&mut self, shard_id: &str, update: F) -> ShardResult<()>
    where
        F: FnOnce(&mut ShardRecord),
    {
        let record = self
            .shards
            .get_mut(shard_id)
            .ok_or_else(|| ShardError::UnknownShard {
                model: self.model_name.clone(),
                shard_id: shard_id.to_string(),
            })?;
        update(record);
        record.updated_at = Utc::now();
        self.touch();
        Ok(())
    }

    pub fn remove_shard(&mut self, shard_id: &str) -> Option<ShardRecord> {
        let removed = self.shards.remove(shard_id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn shard(&self, shard_id: &str) -> Option<&ShardRecord> {
        self.shards.get(shard_id)
    }

    /// Like [`shard`](Self::shard) but reports an unknown id as an error.
    pub fn require_shard(&self, shard_id: &str) -> ShardResult<&ShardRecord> {
        self.shards
            .get(shard_id)
            .ok_or_else(|| ShardError::UnknownShard {
                model: self.model_name.clone(),
                shard_id: shard_id.to_string(),
            })
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.shards.contains_key(shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = (&String, &ShardRecord)> {
        self.shards.iter()
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shards whose declared dependencies do not exist, with the missing ids.
    ///
    /// An empty map means the graph is complete.
    pub fn verify_dependencies(&self) -> BTreeMap<String, Vec<String>> {
        let mut missing = BTreeMap::new();
        for (id, record) in &self.shards {
            let absent: Vec<String> = record
                .depends_on
                .iter()
                .filter(|dep| !self.shards.contains_key(dep.as_str()))
                .cloned()
                .collect();
            if !absent.is_empty() {
                missing.insert(id.clone(), absent);
            }
        }
        missing
    }

    /// Topologically sorted shard ids covering the targets' dependency closure,
    /// or every shard when `targets` is `None`.
    pub fn loading_order(&self, targets: Option<&[String]>) -> ShardResult<Vec<String>> {
        order::loading_order(self, targets)
    }

    /// Shards that declare `shard_id` as a dependency.
    pub fn dependents(&self, shard_id: &str) -> BTreeSet<String> {
        self.reverse_index()
            .get(shard_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Reverse dependency index, built on first use after each change.
    pub fn reverse_index(&self) -> &HashMap<String, BTreeSet<String>> {
        self.reverse.get_or_init(|| {
            let mut index: HashMap<String, BTreeSet<String>> = HashMap::new();
            for (id, record) in &self.shards {
                for dep in &record.depends_on {
                    index.entry(dep.clone()).or_default().insert(id.clone());
                }
            }
            index
        })
    }

    /// Layer name -> owning shard. When a layer appears in several shards the
    /// most recently updated record wins.
    pub fn layer_to_shard(&self) -> HashMap<String, String> {
        let mut records: Vec<(&String, &ShardRecord)> = self.shards.iter().collect();
        records.sort_by(|a, b| a.1.updated_at.cmp(&b.1.updated_at).then(a.0.cmp(b.0)));

        let mut mapping = HashMap::new();
        for (id, record) in records {
            for layer in &record.layers {
                mapping.insert(layer.clone(), id.clone());
            }
        }
        mapping
    }

    /// Basic file check: path present, file exists, and size and hash match
    /// when recorded.
    pub fn verify_shard_file(&self, shard_id: &str, base_dir: &Path) -> ShardResult<()> {
        let record = self.require_shard(shard_id)?;
        let path = record
            .resolve_path(base_dir)
            .ok_or_else(|| ShardError::Metadata {
                message: format!("shard {} has no path", shard_id),
            })?;
        if !path.is_file() {
            return Err(ShardError::MissingFile {
                shard_id: shard_id.to_string(),
                path,
            });
        }

        if record.size_bytes > 0 {
            let actual = std::fs::metadata(&path)?.len();
            if actual != record.size_bytes {
                return Err(ShardError::Metadata {
                    message: format!(
                        "size mismatch for {}: expected {}, got {}",
                        shard_id, record.size_bytes, actual
                    ),
                });
            }
        }

        if let Some(expected) = &record.hash {
            let actual = digest::sha256_file(&path)?;
            if !digest::hashes_match(expected, &actual) {
                return Err(ShardError::HashMismatch {
                    shard_id: shard_id.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}
