//! File-backed shard payloads.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ShardError, ShardResult};
use crate::integrity::{IntegrityChecker, VerificationLevel};
use crate::metadata::MetadataStore;
use crate::pipeline::ShardSource;

/// Payload type held by a [`crate::manager::ShardManager`].
pub trait ShardPayload: Clone + Send + Sync + 'static {
    /// Per-layer view extracted by `load_layers`.
    type Layer: Clone + Send;

    fn layer(&self, name: &str) -> Option<Self::Layer>;
}

/// Raw bytes of one shard file plus the layers it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedShard {
    pub shard_id: String,
    pub layers: Vec<String>,
    pub bytes: Vec<u8>,
}

impl LoadedShard {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl ShardPayload for Arc<LoadedShard> {
    type Layer = Arc<LoadedShard>;

    fn layer(&self, name: &str) -> Option<Self::Layer> {
        self.layers
            .iter()
            .any(|l| l == name)
            .then(|| Arc::clone(self))
    }
}

/// Reads shard files named by a model's metadata.
#[derive(Debug)]
pub struct FileShardSource {
    model: String,
    store: Arc<MetadataStore>,
    base_dir: PathBuf,
    verify: Option<(Arc<IntegrityChecker>, VerificationLevel)>,
}

impl FileShardSource {
    pub fn new(model: impl Into<String>, store: Arc<MetadataStore>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            store,
            base_dir: base_dir.into(),
            verify: None,
        }
    }

    /// Verify each shard at `level` before reading it.
    pub fn with_verification(mut self, checker: Arc<IntegrityChecker>, level: VerificationLevel) -> Self {
        self.verify = Some((checker, level));
        self
    }
}

impl ShardSource<Arc<LoadedShard>> for FileShardSource {
    fn load(&self, shard_id: &str) -> ShardResult<Option<Arc<LoadedShard>>> {
        let record = self.store.shard(&self.model, shard_id)?;
        let path = record
            .resolve_path(&self.base_dir)
            .ok_or_else(|| ShardError::Metadata {
                message: format!("shard {} has no path", shard_id),
            })?;

        if let Some((checker, level)) = &self.verify {
            checker.verify_shard(&self.model, shard_id, *level, false)?;
        }

        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShardError::MissingFile {
                shard_id: shard_id.to_string(),
                path: path.clone(),
            },
            _ => ShardError::from(e),
        })?;
        debug!(model = %self.model, shard_id, bytes = bytes.len(), "read shard file");

        Ok(Some(Arc::new(LoadedShard {
            shard_id: shard_id.to_string(),
            layers: record.layers,
            bytes,
        })))
    }

    fn unload(&self, shard_id: &str) -> bool {
        debug!(model = %self.model, shard_id, "released shard");
        true
    }
}
