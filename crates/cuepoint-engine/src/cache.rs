// SPDX-License-Identifier: GPL-3.0-or-later

//! Memoization of provider answers.
//!
//! The cache is an optimization only: every failure inside it is logged and
//! treated as a miss, so a broken cache can slow a run down but never fail it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cuepoint_config::CacheConfig;
use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cache key over provider identity, provider configuration and segment content.
///
/// Including the provider id means two providers can never read each other's
/// answers for the same audio.
pub fn fingerprint(provider_id: &str, config_version: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(config_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// TTL cache with an in-memory tier and an optional on-disk tier.
///
/// Expired entries are removed when a lookup observes them; nothing sweeps in
/// the background.
#[derive(Clone)]
pub struct ResponseCache {
    enabled: bool,
    memory: Cache<String, Arc<CacheEntry>>,
    directory: Option<PathBuf>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        Self {
            enabled: true,
            memory: Cache::new(max_entries),
            directory: None,
            default_ttl,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            memory: Cache::new(0),
            directory: None,
            default_ttl: Duration::ZERO,
        }
    }

    /// Persist entries as `<fingerprint>.json` files under `directory`.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let cache = Self::new(config.max_entries, Duration::from_secs(config.ttl_secs));
        match &config.directory {
            Some(directory) => cache.with_directory(directory),
            None => cache,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, fingerprint: &str) -> Option<serde_json::Value> {
        if !self.enabled {
            return None;
        }
        let now = Utc::now();

        if let Some(entry) = self.memory.get(fingerprint) {
            if !entry.is_expired_at(now) {
                trace!(target: "cache", %fingerprint, "memory hit");
                return Some(entry.payload.clone());
            }
            trace!(target: "cache", %fingerprint, "evicting expired entry");
            self.memory.invalidate(fingerprint);
            self.remove_file(fingerprint);
            return None;
        }

        let directory = self.directory.as_deref()?;
        match read_entry(&entry_path(directory, fingerprint)) {
            Ok(Some(entry)) if entry.fingerprint != fingerprint => {
                warn!(target: "cache", %fingerprint, "cache file holds a different key, ignoring");
                self.remove_file(fingerprint);
                None
            }
            Ok(Some(entry)) if entry.is_expired_at(now) => {
                trace!(target: "cache", %fingerprint, "evicting expired file");
                self.remove_file(fingerprint);
                None
            }
            Ok(Some(entry)) => {
                trace!(target: "cache", %fingerprint, "disk hit");
                let payload = entry.payload.clone();
                self.memory.insert(fingerprint.to_string(), Arc::new(entry));
                Some(payload)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(target: "cache", %fingerprint, error = %e, "cache read failed, treating as miss");
                self.remove_file(fingerprint);
                None
            }
        }
    }

    pub fn put(&self, fingerprint: &str, payload: serde_json::Value, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            payload,
            expires_at,
        };

        if let Some(directory) = self.directory.as_deref() {
            if let Err(e) = write_entry(directory, &entry) {
                warn!(target: "cache", %fingerprint, error = %e, "cache write failed");
            }
        }
        self.memory.insert(fingerprint.to_string(), Arc::new(entry));
    }

    /// Typed lookup. A payload that no longer deserializes is evicted and reported as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, fingerprint: &str) -> Option<T> {
        let payload = self.get(fingerprint)?;
        match serde_json::from_value(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target: "cache", %fingerprint, error = %e, "cached payload has unexpected shape");
                self.invalidate(fingerprint);
                None
            }
        }
    }

    pub fn put_as<T: Serialize>(&self, fingerprint: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(payload) => self.put(fingerprint, payload, ttl),
            Err(e) => warn!(target: "cache", %fingerprint, error = %e, "cannot serialize payload"),
        }
    }

    pub fn invalidate(&self, fingerprint: &str) {
        self.memory.invalidate(fingerprint);
        self.remove_file(fingerprint);
    }

    pub fn clear(&self) {
        self.memory.invalidate_all();
        let Some(directory) = self.directory.as_deref() else {
            return;
        };
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                warn!(target: "cache", error = %e, "cannot list cache directory");
                return;
            }
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(target: "cache", path = %path.display(), error = %e, "cannot remove cache file");
                }
            }
        }
        debug!(target: "cache", "cache cleared");
    }

    fn remove_file(&self, fingerprint: &str) {
        let Some(directory) = self.directory.as_deref() else {
            return;
        };
        match fs::remove_file(entry_path(directory, fingerprint)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(target: "cache", %fingerprint, error = %e, "cannot remove cache file"),
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("enabled", &self.enabled)
            .field("entries", &self.memory.entry_count())
            .field("directory", &self.directory)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

fn entry_path(directory: &Path, fingerprint: &str) -> PathBuf {
    directory.join(format!("{}.json", fingerprint))
}

fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn write_entry(directory: &Path, entry: &CacheEntry) -> Result<(), CacheError> {
    fs::create_dir_all(directory)?;
    let path = entry_path(directory, &entry.fingerprint);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(entry)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn put_then_get_returns_payload() {
        let cache = ResponseCache::new(100, HOUR);
        let key = fingerprint("acrcloud", "1", "abc");
        cache.put(&key, json!({"title": "Blue Monday"}), HOUR);
        assert_eq!(cache.get(&key), Some(json!({"title": "Blue Monday"})));
    }

    #[test]
    fn zero_ttl_is_never_returned() {
        let cache = ResponseCache::new(100, HOUR);
        cache.put("k", json!(1), Duration::ZERO);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(100, HOUR);
        cache.put("k", json!(1), Duration::from_millis(40));
        assert_eq!(cache.get("k"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn fingerprint_depends_on_every_component() {
        let base = fingerprint("acrcloud", "1", "abc");
        assert_eq!(base, fingerprint("acrcloud", "1", "abc"));
        assert_ne!(base, fingerprint("shazam", "1", "abc"));
        assert_ne!(base, fingerprint("acrcloud", "2", "abc"));
        assert_ne!(base, fingerprint("acrcloud", "1", "abd"));
        // Separators keep component boundaries distinct.
        assert_ne!(fingerprint("ab", "c", "d"), fingerprint("a", "bc", "d"));
    }

    #[test]
    fn typed_round_trip_distinguishes_cached_no_match_from_miss() {
        let cache = ResponseCache::new(100, HOUR);
        cache.put_as("none", &Option::<String>::None, HOUR);
        assert_eq!(cache.get_as::<Option<String>>("none"), Some(None));
        assert_eq!(cache.get_as::<Option<String>>("missing"), None);
    }

    #[test]
    fn mismatched_payload_is_evicted() {
        let cache = ResponseCache::new(100, HOUR);
        cache.put("k", json!("not a number"), HOUR);
        assert_eq!(cache.get_as::<u32>("k"), None);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = ResponseCache::from_config(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.put("k", json!(1), HOUR);
        assert_eq!(cache.get("k"), None);
        assert!(!cache.is_enabled());
    }

    #[test]
    fn disk_tier_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = fingerprint("acrcloud", "1", "abc");

        ResponseCache::new(100, HOUR)
            .with_directory(dir.path())
            .put(&key, json!({"score": 90}), HOUR);

        let reopened = ResponseCache::new(100, HOUR).with_directory(dir.path());
        assert_eq!(reopened.get(&key), Some(json!({"score": 90})));
    }

    #[test]
    fn corrupt_disk_entry_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.json");
        fs::write(&path, b"{ not json").unwrap();

        let cache = ResponseCache::new(100, HOUR).with_directory(dir.path());
        assert_eq!(cache.get("k"), None);
        assert!(!path.exists());
    }

    #[test]
    fn expired_disk_entry_is_removed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CacheEntry {
            fingerprint: "k".to_string(),
            payload: json!(1),
            expires_at: Utc::now() - chrono::Duration::seconds(5),
        };
        fs::write(dir.path().join("k.json"), serde_json::to_vec(&entry).unwrap()).unwrap();

        let cache = ResponseCache::new(100, HOUR).with_directory(dir.path());
        assert_eq!(cache.get("k"), None);
        assert!(!dir.path().join("k.json").exists());
    }

    #[test]
    fn unwritable_directory_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        // A regular file where the cache directory should be.
        let cache = ResponseCache::new(100, HOUR).with_directory(&blocker);
        cache.put("k", json!(1), HOUR);
        assert_eq!(cache.get("k"), Some(json!(1)));
    }

    #[test]
    fn clear_removes_memory_and_disk_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(100, HOUR).with_directory(dir.path());
        cache.put("a", json!(1), HOUR);
        cache.put("b", json!(2), HOUR);

        cache.clear();
        assert_eq!(cache.get("a"), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
