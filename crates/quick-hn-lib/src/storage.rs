//! Persistent store collaborator
//!
//! This module provides a string key/value trait `StorageBackend` with two
//! implementations:
//!
//! - `FileStorage` keeps a single JSON file containing a map of string keys to
//!   string values, read once and flushed synchronously on every mutation.
//! - `MemoryStorage` keeps the map in memory only (tests, throwaway sessions).
//!
//! On top of it, `DatasetStore` persists the two durable datasets of a session
//! (uploaded-file features and URL-sourced features) as one JSON blob each. Store
//! failures never reach the session: they are logged and read as a cache miss.

use crate::feature::Feature;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Platform storage error: {0}")]
    Platform(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key of the persisted toggle for the Lalitpur provider
pub const URL_SOURCE_SETTING_KEY: &str = "qhni-enable-url-source";

/// Simple generic storage backend trait.
///
/// Keys and values are UTF-8 strings. Structured data goes through
/// [`save_json_backend`] and [`load_json_backend`].
pub trait StorageBackend: Send + Sync {
    /// Store a string value for a key.
    fn set_string(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Read a string value for a key. Returns Ok(None) when key is missing.
    fn get_string(&self, key: &str) -> StorageResult<Option<String>>;

    /// Remove a key (no-op if key does not exist).
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// All stored keys
    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }
}

pub fn save_json_backend<T: Serialize>(
    backend: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    match serde_json::to_string(value) {
        Ok(s) => backend.set_string(key, &s),
        Err(e) => Err(StorageError::Json(e.to_string())),
    }
}

pub fn load_json_backend<T: DeserializeOwned>(
    backend: &dyn StorageBackend,
    key: &str,
) -> StorageResult<Option<T>> {
    match backend.get_string(key)? {
        Some(s) => match serde_json::from_str::<T>(&s) {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(StorageError::Json(e.to_string())),
        },
        None => Ok(None),
    }
}

fn lock<'a>(
    inner: &'a Mutex<HashMap<String, String>>,
) -> StorageResult<MutexGuard<'a, HashMap<String, String>>> {
    inner
        .lock()
        .map_err(|e| StorageError::Platform(format!("mutex poisoned: {:?}", e)))
}

/// File-based storage: stores a single JSON file which is a map of key -> string value.
///
/// On init, the file is read into memory. Mutations update memory and flush the file
/// back to disk synchronously.
pub struct FileStorage {
    /// Path to the backing JSON file.
    path: PathBuf,
    /// In-memory copy of key -> value
    inner: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Determine a good default storage file path for the current user.
    /// - On Windows: %APPDATA%/QuickHnImporter/storage.json
    /// - Else: $HOME/.config/quick-hn-importer/storage.json
    pub fn default_storage_path() -> PathBuf {
        if cfg!(windows)
            && let Ok(appdata) = std::env::var("APPDATA")
        {
            return Path::new(&appdata)
                .join("QuickHnImporter")
                .join("storage.json");
        }

        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home)
                .join(".config")
                .join("quick-hn-importer")
                .join("storage.json");
        }

        Path::new(".").join("quick-hn-importer-storage.json")
    }

    pub fn new_with_path(path: Option<PathBuf>) -> StorageResult<Self> {
        let path = path.unwrap_or_else(Self::default_storage_path);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::Io(format!("Failed to create storage parent directory: {}", e))
            })?;
        }

        let mut map: HashMap<String, String> = HashMap::new();
        if path.exists() {
            let s = fs::read_to_string(&path)
                .map_err(|e| StorageError::Io(format!("Failed to read storage file: {}", e)))?;
            if !s.trim().is_empty() {
                map = serde_json::from_str(&s).map_err(|e| {
                    StorageError::Json(format!("Failed to parse storage JSON: {}", e))
                })?;
            }
        }

        tracing::debug!(path = %path.display(), keys = map.len(), "Opened storage file");
        Ok(FileStorage {
            path,
            inner: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_locked(&self, locked: &HashMap<String, String>) -> StorageResult<()> {
        let s = serde_json::to_string_pretty(locked)
            .map_err(|e| StorageError::Json(e.to_string()))?;
        fs::write(&self.path, s).map_err(|e| StorageError::Io(format!("write failed: {}", e)))
    }
}

impl StorageBackend for FileStorage {
    fn set_string(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut guard = lock(&self.inner)?;
        guard.insert(key.to_string(), value.to_string());
        self.flush_locked(&guard)
    }

    fn get_string(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(lock(&self.inner)?.get(key).cloned())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut guard = lock(&self.inner)?;
        if guard.remove(key).is_some() {
            self.flush_locked(&guard)?;
        }
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(lock(&self.inner)?.keys().cloned().collect())
    }
}

/// Volatile storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<HashMap<String, String>>,
}

impl StorageBackend for MemoryStorage {
    fn set_string(&self, key: &str, value: &str) -> StorageResult<()> {
        lock(&self.inner)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_string(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(lock(&self.inner)?.get(key).cloned())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        lock(&self.inner)?.remove(key);
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(lock(&self.inner)?.keys().cloned().collect())
    }
}

/// The durable datasets of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    /// Features from an uploaded file
    Uploaded,
    /// Features from a file fetched by URL
    Url,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Uploaded, DatasetKind::Url];

    pub fn key(&self) -> &'static str {
        match self {
            DatasetKind::Uploaded => "qhni.dataset.uploaded",
            DatasetKind::Url => "qhni.dataset.url",
        }
    }
}

/// One persisted dataset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDataset {
    pub features: Vec<Feature>,
    /// File name or URL the features came from
    pub filename: String,
    pub stored_at: DateTime<Utc>,
    pub count: usize,
}

/// Dataset persistence with "failure means miss" semantics
pub struct DatasetStore {
    backend: Box<dyn StorageBackend>,
}

impl DatasetStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::default()))
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Persist a dataset, replacing the previous one of the same kind
    pub fn save(&self, kind: DatasetKind, features: &[Feature], filename: &str) -> bool {
        let dataset = StoredDataset {
            features: features.to_vec(),
            filename: filename.to_string(),
            stored_at: Utc::now(),
            count: features.len(),
        };
        match save_json_backend(self.backend(), kind.key(), &dataset) {
            Ok(()) => {
                tracing::debug!(key = kind.key(), count = dataset.count, "Stored dataset");
                true
            }
            Err(error) => {
                tracing::warn!(key = kind.key(), %error, "Failed to store dataset");
                false
            }
        }
    }

    /// The stored dataset, `None` when missing or unreadable
    pub fn load(&self, kind: DatasetKind) -> Option<StoredDataset> {
        match load_json_backend::<StoredDataset>(self.backend(), kind.key()) {
            Ok(dataset) => dataset,
            Err(error) => {
                tracing::warn!(key = kind.key(), %error, "Failed to load dataset, ignoring it");
                None
            }
        }
    }

    pub fn clear(&self, kind: DatasetKind) {
        if let Err(error) = self.backend.remove(kind.key()) {
            tracing::warn!(key = kind.key(), %error, "Failed to clear dataset");
        }
    }

    /// Persisted boolean setting, `default` when missing or unreadable
    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.backend.get_string(key) {
            Ok(Some(value)) => value == "true",
            Ok(None) => default,
            Err(error) => {
                tracing::warn!(key, %error, "Failed to read setting");
                default
            }
        }
    }

    pub fn set_flag(&self, key: &str, value: bool) {
        if let Err(error) = self.backend.set_string(key, if value { "true" } else { "false" }) {
            tracing::warn!(key, %error, "Failed to store setting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{AddressProperties, FeatureId};
    use geo::Point;

    fn features() -> Vec<Feature> {
        vec![
            Feature::new(
                FeatureId::new("file-wards-0"),
                Point::new(85.32, 27.67),
                AddressProperties {
                    street: "Mangal Marga".to_string(),
                    street_original: "Mangal Marg".to_string(),
                    number: "12".to_string(),
                    municipality: "wards".to_string(),
                    ..Default::default()
                },
            )
            .unwrap(),
        ]
    }

    #[test]
    fn test_file_storage_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let storage = FileStorage::new_with_path(Some(path.clone())).unwrap();
        storage.set_string("a", "1").unwrap();
        storage.set_string("b", "2").unwrap();
        storage.remove("b").unwrap();
        drop(storage);

        let reopened = FileStorage::new_with_path(Some(path)).unwrap();
        assert_eq!(reopened.get_string("a").unwrap().as_deref(), Some("1"));
        assert_eq!(reopened.get_string("b").unwrap(), None);
        assert_eq!(reopened.keys().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "{broken").unwrap();
        assert!(matches!(
            FileStorage::new_with_path(Some(path)),
            Err(StorageError::Json(_))
        ));
    }

    #[test]
    fn test_dataset_round_trip() {
        let store = DatasetStore::in_memory();
        assert!(store.save(DatasetKind::Uploaded, &features(), "wards.geojson"));

        let dataset = store.load(DatasetKind::Uploaded).unwrap();
        assert_eq!(dataset.count, 1);
        assert_eq!(dataset.filename, "wards.geojson");
        assert_eq!(dataset.features, features());
        assert!(store.load(DatasetKind::Url).is_none());

        store.clear(DatasetKind::Uploaded);
        assert!(store.load(DatasetKind::Uploaded).is_none());
    }

    #[test]
    fn test_unreadable_dataset_is_a_miss() {
        let store = DatasetStore::in_memory();
        store
            .backend()
            .set_string(DatasetKind::Url.key(), "not json")
            .unwrap();
        assert!(store.load(DatasetKind::Url).is_none());
    }

    #[test]
    fn test_flags() {
        let store = DatasetStore::in_memory();
        assert!(!store.flag(URL_SOURCE_SETTING_KEY, false));
        store.set_flag(URL_SOURCE_SETTING_KEY, true);
        assert!(store.flag(URL_SOURCE_SETTING_KEY, false));
    }
}
