//! Shard file integrity verification.
//!
//! # Verification Levels
//!
//! Each level includes every check of the levels before it:
//!
//! 1. `Basic`: the file exists
//! 2. `Hash`: SHA-256 of the file matches the stored hash
//! 3. `Signature`: HMAC-SHA256 of the file matches the stored signature,
//!    keyed by the record's trusted key id
//! 4. `Full`: the file header starts with an accepted magic prefix
//!
//! Below `Signature` an unsigned shard only produces a warning. A stored hash
//! is rewritten only when the caller passes `update_hash`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::digest;
use crate::error::{ShardError, ShardResult};
use crate::keyring::KeyRing;
use crate::metadata::{MetadataStore, ShardRecord};

/// Bytes read for the header check.
pub const HEADER_LEN: usize = 16;

/// Strength of a verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    Basic,
    Hash,
    Signature,
    Full,
}

impl fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Basic => "basic",
            Self::Hash => "hash",
            Self::Signature => "signature",
            Self::Full => "full",
        };
        f.write_str(name)
    }
}

impl FromStr for VerificationLevel {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "hash" => Ok(Self::Hash),
            "signature" => Ok(Self::Signature),
            "full" => Ok(Self::Full),
            other => Err(ShardError::Config {
                message: format!("unknown verification level: {}", other),
            }),
        }
    }
}

/// Accepted shard file formats, identified by magic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardFormat {
    Gguf,
    Ggml,
    Safetensors,
    Zip,
}

impl ShardFormat {
    pub const ALL: [ShardFormat; 4] = [
        ShardFormat::Gguf,
        ShardFormat::Ggml,
        ShardFormat::Safetensors,
        ShardFormat::Zip,
    ];

    pub fn magic(&self) -> &'static [u8] {
        match self {
            Self::Gguf => b"GGUF",
            Self::Ggml => b"GGML",
            Self::Safetensors => b"SAFETENSORS",
            Self::Zip => b"PK\x03\x04",
        }
    }

    /// Format whose magic prefixes `header`.
    pub fn detect(header: &[u8], accepted: &[ShardFormat]) -> Option<ShardFormat> {
        accepted
            .iter()
            .copied()
            .find(|format| header.starts_with(format.magic()))
    }
}

/// Integrity checker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Level used by load-time verification and recovery probes.
    pub level: VerificationLevel,
    pub accepted_formats: Vec<ShardFormat>,
    /// Verify every shard before the file source reads it.
    pub verify_on_load: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            level: VerificationLevel::Hash,
            accepted_formats: ShardFormat::ALL.to_vec(),
            verify_on_load: false,
        }
    }
}

/// Successful verification of one shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyReport {
    pub shard_id: String,
    pub level: VerificationLevel,
    /// The stored hash was rewritten because `update_hash` was set.
    pub hash_updated: bool,
    pub format: Option<ShardFormat>,
    pub warnings: Vec<String>,
}

/// Outcome for one shard inside a model-wide pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardVerification {
    pub passed: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl From<ShardResult<VerifyReport>> for ShardVerification {
    fn from(result: ShardResult<VerifyReport>) -> Self {
        match result {
            Ok(report) => Self {
                passed: true,
                error: None,
                warnings: report.warnings,
            },
            Err(e) => Self {
                passed: false,
                error: Some(e.to_string()),
                warnings: Vec::new(),
            },
        }
    }
}

/// Dependency completeness plus per-shard verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyIntegrityReport {
    pub success: bool,
    pub missing_dependencies: BTreeMap<String, Vec<String>>,
    pub results: BTreeMap<String, ShardVerification>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Signing and hashing coverage of a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationStatus {
    pub model: String,
    pub total_shards: usize,
    pub hashed_shards: usize,
    pub signed_shards: usize,
    pub last_verified: Option<DateTime<Utc>>,
    pub last_passed: usize,
    pub last_failed: usize,
}

#[derive(Debug, Clone)]
struct LastRun {
    at: DateTime<Utc>,
    passed: usize,
    failed: usize,
}

/// Verifies shard files against their metadata.
#[derive(Debug)]
pub struct IntegrityChecker {
    store: Arc<MetadataStore>,
    base_dir: PathBuf,
    keys: KeyRing,
    config: IntegrityConfig,
    last_runs: Mutex<HashMap<String, LastRun>>,
}

impl IntegrityChecker {
    pub fn new(store: Arc<MetadataStore>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            base_dir: base_dir.into(),
            keys: KeyRing::new(),
            config: IntegrityConfig::default(),
            last_runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_keys(mut self, keys: KeyRing) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_config(mut self, config: IntegrityConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    fn shard_path(&self, shard_id: &str, record: &ShardRecord) -> ShardResult<PathBuf> {
        record
            .resolve_path(&self.base_dir)
            .ok_or_else(|| ShardError::Metadata {
                message: format!("shard {} has no path", shard_id),
            })
    }

    /// Resolved file path of a shard.
    pub fn path_of(&self, model: &str, shard_id: &str) -> ShardResult<PathBuf> {
        let record = self.store.shard(model, shard_id)?;
        self.shard_path(shard_id, &record)
    }

    /// Verify one shard at `level`.
    pub fn verify_shard(
        &self,
        model: &str,
        shard_id: &str,
        level: VerificationLevel,
        update_hash: bool,
    ) -> ShardResult<VerifyReport> {
        let record = self.store.shard(model, shard_id)?;
        let path = self.shard_path(shard_id, &record)?;
        if !path.is_file() {
            return Err(ShardError::MissingFile {
                shard_id: shard_id.to_string(),
                path,
            });
        }

        let mut report = VerifyReport {
            shard_id: shard_id.to_string(),
            level,
            hash_updated: false,
            format: None,
            warnings: Vec::new(),
        };

        if level >= VerificationLevel::Hash {
            self.check_hash(model, shard_id, &record, &path, update_hash, &mut report)?;
        }

        if level >= VerificationLevel::Signature {
            self.check_signature(shard_id, &record, &path)?;
        } else if record.signature.is_none() {
            report.warnings.push("shard is unsigned".to_string());
        }

        if level >= VerificationLevel::Full {
            report.format = Some(self.check_header(shard_id, &path)?);
        }

        for warning in &report.warnings {
            warn!(model, shard_id, warning = %warning, "verification warning");
        }
        debug!(model, shard_id, level = %level, "shard verified");
        Ok(report)
    }

    fn check_hash(
        &self,
        model: &str,
        shard_id: &str,
        record: &ShardRecord,
        path: &Path,
        update_hash: bool,
        report: &mut VerifyReport,
    ) -> ShardResult<()> {
        let actual = digest::sha256_file(path)?;
        match &record.hash {
            Some(expected) if digest::hashes_match(expected, &actual) => Ok(()),
            Some(expected) if !update_hash => {
                warn!(model, shard_id, expected = %expected, actual = %actual, "hash mismatch");
                Err(ShardError::HashMismatch {
                    shard_id: shard_id.to_string(),
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(expected) => {
                report
                    .warnings
                    .push(format!("stored hash {} replaced", expected));
                self.store_hash(model, shard_id, actual)?;
                report.hash_updated = true;
                Ok(())
            }
            None if update_hash => {
                self.store_hash(model, shard_id, actual)?;
                report.hash_updated = true;
                Ok(())
            }
            None => {
                report.warnings.push("no stored hash".to_string());
                Ok(())
            }
        }
    }

    fn store_hash(&self, model: &str, shard_id: &str, hash: String) -> ShardResult<()> {
        self.store
            .update_shard(model, shard_id, |r| r.hash = Some(hash))?;
        self.store.save(model)
    }

    fn check_signature(&self, shard_id: &str, record: &ShardRecord, path: &Path) -> ShardResult<()> {
        let fail = |reason: String| ShardError::Signature {
            shard_id: shard_id.to_string(),
            reason,
        };
        let signature = record
            .signature
            .as_deref()
            .ok_or_else(|| fail("missing signature".to_string()))?;
        let key_id = record
            .key_id
            .as_deref()
            .ok_or_else(|| fail("signature has no key id".to_string()))?;
        let key = self
            .keys
            .key(key_id)
            .ok_or_else(|| fail(format!("key not trusted: {}", key_id)))?;

        if digest::verify_hmac_sha256_file(path, key, signature)? {
            Ok(())
        } else {
            Err(fail("signature mismatch".to_string()))
        }
    }

    fn check_header(&self, shard_id: &str, path: &Path) -> ShardResult<ShardFormat> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        File::open(path)?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)?;

        ShardFormat::detect(&header, &self.config.accepted_formats).ok_or_else(|| {
            ShardError::Header {
                shard_id: shard_id.to_string(),
                reason: format!("unrecognised header {}", hex::encode(&header[..header.len().min(8)])),
            }
        })
    }

    /// Verify every shard of a model.
    pub fn verify_model_shards(
        &self,
        model: &str,
        level: VerificationLevel,
    ) -> ShardResult<BTreeMap<String, ShardVerification>> {
        let ids = self.store.with_model(model, |meta| meta.shard_ids())?;
        let results: BTreeMap<String, ShardVerification> = ids
            .into_iter()
            .map(|id| {
                let outcome = self.verify_shard(model, &id, level, false).into();
                (id, outcome)
            })
            .collect();

        let passed = results.values().filter(|r| r.passed).count();
        let failed = results.len() - passed;
        self.last_runs.lock().insert(
            model.to_string(),
            LastRun {
                at: Utc::now(),
                passed,
                failed,
            },
        );
        info!(model, level = %level, passed, failed, "verified model shards");
        Ok(results)
    }

    /// Dependency completeness plus per-shard verification in one summary.
    pub fn verify_dependency_integrity(
        &self,
        model: &str,
        level: VerificationLevel,
    ) -> ShardResult<DependencyIntegrityReport> {
        let missing_dependencies = self.store.with_model(model, |meta| meta.verify_dependencies())?;
        let results = self.verify_model_shards(model, level)?;
        let passed = results.values().filter(|r| r.passed).count();
        let failed = results.len() - passed;
        Ok(DependencyIntegrityReport {
            success: missing_dependencies.is_empty() && failed == 0,
            missing_dependencies,
            total: results.len(),
            passed,
            failed,
            results,
        })
    }

    /// Sign a shard with a trusted key and persist the signature.
    pub fn generate_shard_signature(
        &self,
        model: &str,
        shard_id: &str,
        key_id: &str,
    ) -> ShardResult<String> {
        let key = self.keys.key(key_id).ok_or_else(|| ShardError::Signature {
            shard_id: shard_id.to_string(),
            reason: format!("key not trusted: {}", key_id),
        })?;
        let path = self.path_of(model, shard_id)?;
        if !path.is_file() {
            return Err(ShardError::MissingFile {
                shard_id: shard_id.to_string(),
                path,
            });
        }

        let signature = digest::hmac_sha256_file(&path, key)?;
        let stored = signature.clone();
        self.store.update_shard(model, shard_id, |r| {
            r.signature = Some(stored);
            r.key_id = Some(key_id.to_string());
        })?;
        self.store.save(model)?;
        info!(model, shard_id, key_id, "signed shard");
        Ok(signature)
    }

    /// Recompute and store the hash of every shard whose file exists.
    /// Returns the number of hashes written.
    pub fn update_all_hashes(&self, model: &str) -> ShardResult<usize> {
        let paths: Vec<(String, Option<PathBuf>)> = self.store.with_model(model, |meta| {
            meta.shards()
                .map(|(id, record)| (id.clone(), record.resolve_path(&self.base_dir)))
                .collect()
        })?;

        let mut updated = 0;
        for (shard_id, path) in paths {
            let Some(path) = path.filter(|p| p.is_file()) else {
                warn!(model, shard_id = %shard_id, "skipping hash update, file missing");
                continue;
            };
            let hash = digest::sha256_file(&path)?;
            self.store
                .update_shard(model, &shard_id, |r| r.hash = Some(hash))?;
            updated += 1;
        }
        self.store.save(model)?;
        info!(model, updated, "updated shard hashes");
        Ok(updated)
    }

    pub fn verification_status(&self, model: &str) -> ShardResult<VerificationStatus> {
        let (total, hashed, signed) = self.store.with_model(model, |meta| {
            let hashed = meta.shards().filter(|(_, r)| r.hash.is_some()).count();
            let signed = meta.shards().filter(|(_, r)| r.signature.is_some()).count();
            (meta.len(), hashed, signed)
        })?;
        let last = self.last_runs.lock().get(model).cloned();
        Ok(VerificationStatus {
            model: model.to_string(),
            total_shards: total,
            hashed_shards: hashed,
            signed_shards: signed,
            last_verified: last.as_ref().map(|l| l.at),
            last_passed: last.as_ref().map_or(0, |l| l.passed),
            last_failed: last.as_ref().map_or(0, |l| l.failed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_checker(files: &[(&str, &[u8])]) -> (IntegrityChecker, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::in_memory());
        store.create_model("m");
        for (id, content) in files {
            let name = format!("{}.bin", id);
            fs::write(dir.path().join(&name), content).unwrap();
            let hash = digest::sha256_hex_reader(*content).unwrap();
            store
                .add_shard("m", id, ShardRecord::new().with_path(name).with_hash(hash))
                .unwrap();
        }
        let keys = KeyRing::new().with_key("k1", "secret").unwrap();
        let checker = IntegrityChecker::new(store, dir.path()).with_keys(keys);
        (checker, dir)
    }

    // ==================== Levels ====================

    #[test]
    fn test_basic_only_checks_existence() {
        let (checker, dir) = create_test_checker(&[("s1", b"GGUF data")]);
        fs::write(dir.path().join("s1.bin"), b"tampered").unwrap();
        let report = checker
            .verify_shard("m", "s1", VerificationLevel::Basic, false)
            .unwrap();
        assert_eq!(report.warnings, vec!["shard is unsigned"]);

        fs::remove_file(dir.path().join("s1.bin")).unwrap();
        assert!(matches!(
            checker.verify_shard("m", "s1", VerificationLevel::Basic, false),
            Err(ShardError::MissingFile { .. })
        ));
    }

    #[test]
    fn test_hash_mismatch_does_not_mutate_without_flag() {
        let (checker, dir) = create_test_checker(&[("s1", b"GGUF data")]);
        let original = checker.store().shard("m", "s1").unwrap().hash;
        fs::write(dir.path().join("s1.bin"), b"GGUF other").unwrap();

        let err = checker
            .verify_shard("m", "s1", VerificationLevel::Hash, false)
            .unwrap_err();
        assert!(matches!(err, ShardError::HashMismatch { .. }));
        assert_eq!(checker.store().shard("m", "s1").unwrap().hash, original);
    }

    #[test]
    fn test_hash_mismatch_updates_with_flag() {
        let (checker, dir) = create_test_checker(&[("s1", b"GGUF data")]);
        fs::write(dir.path().join("s1.bin"), b"GGUF other").unwrap();

        let report = checker
            .verify_shard("m", "s1", VerificationLevel::Hash, true)
            .unwrap();
        assert!(report.hash_updated);
        let stored = checker.store().shard("m", "s1").unwrap().hash.unwrap();
        assert_eq!(stored, digest::sha256_hex_reader(&b"GGUF other"[..]).unwrap());
        assert!(checker
            .verify_shard("m", "s1", VerificationLevel::Hash, false)
            .is_ok());
    }

    #[test]
    fn test_missing_hash_is_not_filled_implicitly() {
        let (checker, _dir) = create_test_checker(&[("s1", b"GGUF data")]);
        checker
            .store()
            .update_shard("m", "s1", |r| r.hash = None)
            .unwrap();
        let report = checker
            .verify_shard("m", "s1", VerificationLevel::Hash, false)
            .unwrap();
        assert!(report.warnings.iter().any(|w| w == "no stored hash"));
        assert!(checker.store().shard("m", "s1").unwrap().hash.is_none());
    }

    #[test]
    fn test_signature_required_at_signature_level() {
        let (checker, _dir) = create_test_checker(&[("s1", b"GGUF data")]);
        assert!(matches!(
            checker.verify_shard("m", "s1", VerificationLevel::Signature, false),
            Err(ShardError::Signature { .. })
        ));

        checker.generate_shard_signature("m", "s1", "k1").unwrap();
        let report = checker
            .verify_shard("m", "s1", VerificationLevel::Signature, false)
            .unwrap();
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_signature_detects_tamper_and_untrusted_key() {
        let (checker, dir) = create_test_checker(&[("s1", b"GGUF data")]);
        checker.generate_shard_signature("m", "s1", "k1").unwrap();

        checker
            .store()
            .update_shard("m", "s1", |r| r.key_id = Some("ghost".into()))
            .unwrap();
        let err = checker
            .verify_shard("m", "s1", VerificationLevel::Signature, false)
            .unwrap_err();
        assert!(err.to_string().contains("key not trusted"));

        checker
            .store()
            .update_shard("m", "s1", |r| r.key_id = Some("k1".into()))
            .unwrap();
        fs::write(dir.path().join("s1.bin"), b"GGUF evil").unwrap();
        checker.update_all_hashes("m").unwrap();
        let err = checker
            .verify_shard("m", "s1", VerificationLevel::Signature, false)
            .unwrap_err();
        assert!(err.to_string().contains("signature mismatch"));
    }

    #[test]
    fn test_full_checks_header() {
        let (checker, _dir) = create_test_checker(&[("good", b"GGUF\x03\x00rest"), ("zip", b"PK\x03\x04..."), ("bad", b"\x00\x01junk")]);
        for id in ["good", "zip", "bad"] {
            checker.generate_shard_signature("m", id, "k1").unwrap();
        }
        let good = checker
            .verify_shard("m", "good", VerificationLevel::Full, false)
            .unwrap();
        assert_eq!(good.format, Some(ShardFormat::Gguf));
        assert!(checker
            .verify_shard("m", "zip", VerificationLevel::Full, false)
            .is_ok());
        assert!(matches!(
            checker.verify_shard("m", "bad", VerificationLevel::Full, false),
            Err(ShardError::Header { .. })
        ));
    }

    // ==================== Model-wide ====================

    #[test]
    fn test_dependency_integrity_summary() {
        let (checker, dir) = create_test_checker(&[("s1", b"GGUF a"), ("s2", b"GGUF b")]);
        checker
            .store()
            .add_shard(
                "m",
                "s4",
                ShardRecord::new().with_path("s4.bin").with_dependencies(["s5"]),
            )
            .unwrap();
        fs::write(dir.path().join("s2.bin"), b"GGUF changed").unwrap();

        let report = checker
            .verify_dependency_integrity("m", VerificationLevel::Hash)
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.missing_dependencies["s4"], vec!["s5".to_string()]);
        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 2);
        assert!(report.results["s1"].passed);

        let status = checker.verification_status("m").unwrap();
        assert_eq!(status.total_shards, 3);
        assert_eq!(status.hashed_shards, 2);
        assert_eq!(status.signed_shards, 0);
        assert_eq!(status.last_failed, 2);
        assert!(status.last_verified.is_some());
    }

    #[test]
    fn test_level_parsing_and_order() {
        assert_eq!("FULL".parse::<VerificationLevel>().unwrap(), VerificationLevel::Full);
        assert!("paranoid".parse::<VerificationLevel>().is_err());
        assert!(VerificationLevel::Basic < VerificationLevel::Hash);
        assert!(VerificationLevel::Signature < VerificationLevel::Full);
    }
}
