//! Process-local TTL cache
//!
//! A string-keyed map of JSON values with an absolute expiry per entry.
//! Reads past expiry are misses. The whole table can be written to an
//! encrypted file at shutdown and read back at start, minus keys the caller
//! excludes (the accessory list, which is always rebuilt from the live
//! graph).

mod crypto;

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crypto::CACHE_FORMAT_VERSION;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error on the cache file
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value or file could not be (de)serialized
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption or decryption failed
    #[error("cache crypto error: {0}")]
    Crypto(String),
}

/// One cached value
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    /// Stored value
    pub value: Value,
    /// Wall-clock expiry
    pub expires_at: SystemTime,
}

impl CacheEntry {
    fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

/// Persisted form of one entry; `ttl` is the absolute expiry in unix ms
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    key: String,
    value: Value,
    ttl: u64,
}

fn to_unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Expiring key/value table
#[derive(Debug, Default)]
pub struct Cache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl Cache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for `key`, deserialized as `T`
    ///
    /// A value that no longer deserializes as `T` is treated as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Fresh raw value for `key`
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let now = SystemTime::now();
        self.entries
            .read()
            .get(key)
            .filter(|e| e.is_fresh(now))
            .map(|e| e.value.clone())
    }

    /// Store `value` under `key` for `ttl`
    ///
    /// # Errors
    ///
    /// `Serialization` if `value` cannot be represented as JSON.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value)?;
        self.set_value(key, value, ttl);
        Ok(())
    }

    /// Store a raw JSON value under `key` for `ttl`
    pub fn set_value(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: SystemTime::now() + ttl,
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Push a fresh entry's expiry to `ttl` from now; false on a miss
    pub fn touch(&self, key: &str, ttl: Duration) -> bool {
        let now = SystemTime::now();
        match self.entries.write().get_mut(key) {
            Some(entry) if entry.is_fresh(now) => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    /// Remove `key`, returning its value if it was still fresh
    pub fn remove(&self, key: &str) -> Option<Value> {
        let now = SystemTime::now();
        self.entries
            .write()
            .remove(key)
            .filter(|e| e.is_fresh(now))
            .map(|e| e.value)
    }

    /// Edit a fresh entry in place, keeping its expiry
    ///
    /// Returns `Ok(false)` on a miss without calling `f`.
    ///
    /// # Errors
    ///
    /// `Serialization` if the stored value is not a `T`; the entry is left
    /// as it was.
    pub fn update<T, F>(&self, key: &str, f: F) -> Result<bool, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let now = SystemTime::now();
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key).filter(|e| e.is_fresh(now)) else {
            return Ok(false);
        };

        let mut typed: T = serde_json::from_value(entry.value.clone())?;
        f(&mut typed);
        entry.value = serde_json::to_value(&typed)?;
        Ok(true)
    }

    /// Drop every expired entry, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        before - entries.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of fresh entries
    pub fn len(&self) -> usize {
        let now = SystemTime::now();
        self.entries.read().values().filter(|e| e.is_fresh(now)).count()
    }

    /// True when no fresh entry remains
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted keys of fresh entries
    pub fn keys(&self) -> Vec<String> {
        let now = SystemTime::now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_fresh(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Write fresh entries to `path`, encrypted, skipping `exclude`
    ///
    /// The file is replaced atomically via a sibling temp file. Returns the
    /// number of records written.
    ///
    /// # Errors
    ///
    /// Serialization, encryption or I/O failure.
    pub fn save(&self, path: &Path, exclude: &[&str]) -> Result<usize, CacheError> {
        let now = SystemTime::now();
        let records: Vec<CacheRecord> = self
            .entries
            .read()
            .iter()
            .filter(|(k, e)| e.is_fresh(now) && !exclude.contains(&k.as_str()))
            .map(|(k, e)| CacheRecord {
                key: k.clone(),
                value: e.value.clone(),
                ttl: to_unix_millis(e.expires_at),
            })
            .collect();

        let plaintext = serde_json::to_vec(&records)?;
        let sealed = crypto::seal(&plaintext)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&sealed)?)?;
        std::fs::rename(&tmp, path)?;

        info!(path = ?path, records = records.len(), "Saved cache");
        Ok(records.len())
    }

    /// Read a table written by [`Cache::save`]
    ///
    /// Never fails: a missing, unreadable, undecryptable or malformed file
    /// yields an empty cache. Records already expired are dropped.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let cache = Self::new();
        if !path.exists() {
            debug!(path = ?path, "No persisted cache");
            return cache;
        }

        match read_records(path) {
            Ok(records) => {
                let now = SystemTime::now();
                let mut entries = cache.entries.write();
                for record in records {
                    let expires_at = UNIX_EPOCH + Duration::from_millis(record.ttl);
                    if expires_at > now {
                        entries.insert(
                            record.key,
                            CacheEntry {
                                value: record.value,
                                expires_at,
                            },
                        );
                    }
                }
                info!(path = ?path, records = entries.len(), "Loaded cache");
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Discarding unreadable cache file");
            }
        }
        cache
    }
}

fn read_records(path: &Path) -> Result<Vec<CacheRecord>, CacheError> {
    let bytes = std::fs::read(path)?;
    let sealed: crypto::SealedCache = serde_json::from_slice(&bytes)?;
    let plaintext = crypto::open(&sealed)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::thread::sleep;
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_get_set_typed() {
        let cache = Cache::new();
        cache.set("names", &vec!["a", "b"], MINUTE).unwrap();

        let names: Vec<String> = cache.get("names").unwrap();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cache.get::<u32>("names"), None);
        assert_eq!(cache.get::<u32>("missing"), None);
    }

    #[test]
    fn test_expired_read_is_miss() {
        let cache = Cache::new();
        cache.set_value("k", json!(1), Duration::from_millis(20));
        assert_eq!(cache.get_value("k"), Some(json!(1)));

        sleep(Duration::from_millis(40));
        assert_eq!(cache.get_value("k"), None);
        assert!(!cache.touch("k", MINUTE), "expired entries cannot be revived");
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_touch_extends_without_changing_value() {
        let cache = Cache::new();
        cache.set_value("k", json!("v"), Duration::from_millis(30));
        assert!(cache.touch("k", MINUTE));

        sleep(Duration::from_millis(50));
        assert_eq!(cache.get_value("k"), Some(json!("v")));
    }

    #[test]
    fn test_update_keeps_expiry() {
        let cache = Cache::new();
        cache.set("n", &vec![1, 2, 3], Duration::from_millis(40)).unwrap();

        let hit = cache.update::<Vec<i32>, _>("n", |v| v[0] = 9).unwrap();
        assert!(hit);
        assert_eq!(cache.get::<Vec<i32>>("n"), Some(vec![9, 2, 3]));

        sleep(Duration::from_millis(60));
        assert_eq!(cache.get::<Vec<i32>>("n"), None);
        assert!(!cache.update::<Vec<i32>, _>("n", |v| v.clear()).unwrap());
    }

    #[test]
    fn test_keys_len_remove_clear() {
        let cache = Cache::new();
        cache.set_value("b", json!(2), MINUTE);
        cache.set_value("a", json!(1), MINUTE);
        assert_eq!(cache.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.remove("a"), Some(json!(1)));
        assert_eq!(cache.remove("a"), None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_load_excludes_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let cache = Cache::new();
        cache.set_value("token", json!({"user": "admin"}), MINUTE);
        cache.set_value("accessories:den", json!([1, 2]), MINUTE);
        cache.set_value("gone", json!(0), Duration::from_millis(1));
        sleep(Duration::from_millis(5));

        let written = cache.save(&path, &["accessories:den"]).unwrap();
        assert_eq!(written, 1);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("admin"), "file must not hold plaintext");

        let loaded = Cache::load(&path);
        assert_eq!(loaded.keys(), vec!["token".to_string()]);
        assert_eq!(loaded.get_value("token"), Some(json!({"user": "admin"})));
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        std::fs::write(&path, b"not json at all").unwrap();
        assert!(Cache::load(&path).is_empty());

        std::fs::write(&path, br#"{"nonce":"AAAA","ciphertext":"AAAA","version":1}"#).unwrap();
        assert!(Cache::load(&path).is_empty());

        assert!(Cache::load(&dir.path().join("absent.json")).is_empty());
    }
}
