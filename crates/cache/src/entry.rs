//! Cache entry record and its on-disk location

use chrono::{DateTime, Utc};
use filebridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One cached value.
///
/// This is also the exact JSON layout of `cache/<namespace>/<key>.json`.
/// `expires_at` is authoritative; `ttl` records the requested lifetime in
/// whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: u64,
}

impl CacheEntry {
    pub fn new(data: serde_json::Value, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let lifetime = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let expires_at = created_at
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            data,
            created_at,
            expires_at,
            ttl: ttl.as_secs(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Namespaces become directory names and must be plain identifiers
pub fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace.len() <= 64
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "invalid cache namespace '{namespace}'"
        )))
    }
}

fn is_filename_safe(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// File stem for `key`: the key itself when safe, else its SHA-256 hex digest
pub fn file_stem(key: &str) -> String {
    if is_filename_safe(key) {
        key.to_string()
    } else {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub fn namespace_dir(base_dir: &Path, namespace: &str) -> PathBuf {
    base_dir.join(namespace)
}

pub fn entry_path(base_dir: &Path, namespace: &str, key: &str) -> PathBuf {
    namespace_dir(base_dir, namespace).join(format!("{}.json", file_stem(key)))
}
