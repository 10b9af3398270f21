//! Error types for shard lifecycle management.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Shard subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// No metadata is registered for the model.
    #[error("unknown model: {model}")]
    UnknownModel { model: String },

    /// Shard id not present in the model's metadata.
    #[error("unknown shard: {model}/{shard_id}")]
    UnknownShard { model: String, shard_id: String },

    /// One or more shards reference dependencies that do not exist.
    #[error("missing dependencies in {model}: {}", format_missing(.missing))]
    MissingDependencies {
        model: String,
        missing: BTreeMap<String, Vec<String>>,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle in {model}: {}", .cycle.join(" -> "))]
    DependencyCycle { model: String, cycle: Vec<String> },

    /// A dependency could not be made resident before its dependent.
    #[error("dependency {dependency} of {shard_id} could not be loaded")]
    DependencyUnavailable { shard_id: String, dependency: String },

    /// Cache strategy name not recognised.
    #[error("unknown cache strategy: {name}")]
    UnknownStrategy { name: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Shard content does not match the stored hash.
    #[error("hash mismatch for {shard_id}: expected {expected}, got {actual}")]
    HashMismatch {
        shard_id: String,
        expected: String,
        actual: String,
    },

    /// Signature verification failed.
    #[error("signature verification failed for {shard_id}: {reason}")]
    Signature { shard_id: String, reason: String },

    /// File header does not match any accepted format.
    #[error("invalid header for {shard_id}: {reason}")]
    Header { shard_id: String, reason: String },

    /// Shard file does not exist.
    #[error("shard file missing for {shard_id}: {}", .path.display())]
    MissingFile { shard_id: String, path: PathBuf },

    /// Filesystem error.
    #[error("io error: {message}")]
    Io { message: String },

    /// Metadata could not be read, parsed or written.
    #[error("metadata error: {message}")]
    Metadata { message: String },

    /// The load callback failed.
    #[error("failed to load {shard_id}: {reason}")]
    LoadFailed { shard_id: String, reason: String },

    /// The shard is already being recovered by another caller.
    #[error("recovery already in progress for {shard_id}")]
    RecoveryInProgress { shard_id: String },

    /// Every configured recovery action failed.
    #[error("recovery exhausted for {shard_id} after {attempts} attempt(s)")]
    RecoveryExhausted { shard_id: String, attempts: usize },

    /// Background worker could not be started or stopped.
    #[error("worker error: {message}")]
    Worker { message: String },
}

fn format_missing(missing: &BTreeMap<String, Vec<String>>) -> String {
    missing
        .iter()
        .map(|(shard, deps)| format!("{} requires [{}]", shard, deps.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ShardError {
    /// Dependency graph errors. These describe bad configuration and are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::MissingDependencies { .. } | Self::DependencyCycle { .. }
        )
    }

    /// Content verification errors.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. } | Self::Signature { .. } | Self::Header { .. }
        )
    }

    /// Whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::LoadFailed { .. })
    }
}

impl From<std::io::Error> for ShardError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Metadata {
            message: err.to_string(),
        }
    }
}

/// Result type for shard operations.
pub type ShardResult<T> = Result<T, ShardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dependencies_message() {
        let mut missing = BTreeMap::new();
        missing.insert("s4".to_string(), vec!["s5".to_string()]);
        let err = ShardError::MissingDependencies {
            model: "m".to_string(),
            missing,
        };
        assert_eq!(
            err.to_string(),
            "missing dependencies in m: s4 requires [s5]"
        );
        assert!(err.is_structural());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_message() {
        let err = ShardError::DependencyCycle {
            model: "m".to_string(),
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle in m: a -> b -> a");
        assert!(err.is_structural());
    }

    #[test]
    fn test_classification() {
        let mismatch = ShardError::HashMismatch {
            shard_id: "s1".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(mismatch.is_integrity());
        assert!(!mismatch.is_structural());

        let io: ShardError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(io.is_retryable());
        assert!(!io.is_integrity());
    }
}
