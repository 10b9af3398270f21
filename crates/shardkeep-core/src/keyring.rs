//! Trusted HMAC keys for shard signatures.
//!
//! Keys are addressed by id; a shard record names the id its signature was
//! produced with. Keys can come from:
//! - explicit registration ([`KeyRing::add_key`])
//! - the `SHARDKEEP_SIGNING_KEYS` environment variable (`id=secret,id2=secret2`)

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::error::{ShardError, ShardResult};

pub const SIGNING_KEYS_ENV: &str = "SHARDKEEP_SIGNING_KEYS";

/// Map of key id to secret.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, Vec<u8>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys from `SHARDKEEP_SIGNING_KEYS`. Malformed entries are skipped.
    pub fn from_env() -> Self {
        std::env::var(SIGNING_KEYS_ENV)
            .ok()
            .map(|v| Self::parse_lenient(&v))
            .unwrap_or_default()
    }

    fn parse_lenient(raw: &str) -> Self {
        let mut ring = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match ring.add_entry(entry) {
                Ok(()) => {}
                Err(e) => warn!(error = %e, "ignoring signing key entry"),
            }
        }
        ring
    }

    /// Parse `id=secret[,id=secret...]`, rejecting malformed entries.
    pub fn parse(raw: &str) -> ShardResult<Self> {
        let mut ring = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            ring.add_entry(entry)?;
        }
        Ok(ring)
    }

    fn add_entry(&mut self, entry: &str) -> ShardResult<()> {
        let (id, secret) = entry.split_once('=').ok_or_else(|| ShardError::Config {
            message: format!("signing key entry must be id=secret: {}", entry),
        })?;
        self.add_key(id.trim(), secret.trim().as_bytes())
    }

    pub fn with_key(mut self, key_id: &str, secret: impl AsRef<[u8]>) -> ShardResult<Self> {
        self.add_key(key_id, secret)?;
        Ok(self)
    }

    pub fn add_key(&mut self, key_id: &str, secret: impl AsRef<[u8]>) -> ShardResult<()> {
        let secret = secret.as_ref();
        if key_id.is_empty() || secret.is_empty() {
            return Err(ShardError::Config {
                message: "signing key id and secret must be non-empty".to_string(),
            });
        }
        self.keys.insert(key_id.to_string(), secret.to_vec());
        Ok(())
    }

    pub fn remove_key(&mut self, key_id: &str) -> bool {
        self.keys.remove(key_id).is_some()
    }

    pub fn key(&self, key_id: &str) -> Option<&[u8]> {
        self.keys.get(key_id).map(Vec::as_slice)
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("key_ids", &self.key_ids())
            .finish()
    }
}
