//! Filesystem helpers shared by metadata, snapshots and backups.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{ShardError, ShardResult};

pub(crate) fn default_metadata_dir_impl() -> ShardResult<PathBuf> {
    let base = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| ShardError::Config {
            message: "could not determine metadata directory".to_string(),
        })?;

    Ok(base.join("shardkeep").join("metadata"))
}

pub(crate) fn write_atomic_impl(path: &Path, content: &[u8]) -> ShardResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| ShardError::Io {
        message: format!("failed to create {}: {}", parent.display(), e),
    })?;

    // Unique temp file per writer, in the target directory so the rename stays atomic.
    let mut temp = NamedTempFile::new_in(parent).map_err(|e| ShardError::Io {
        message: format!("failed to create temp file in {}: {}", parent.display(), e),
    })?;
    temp.write_all(content).map_err(|e| ShardError::Io {
        message: format!("failed to write temp file: {}", e),
    })?;

    temp.persist(path).map_err(|e| ShardError::Io {
        message: format!("failed to persist {}: {}", path.display(), e.error),
    })?;

    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> ShardResult<()> {
    let content = serde_json::to_vec_pretty(value)?;
    write_atomic_impl(path, &content)
}
