// Directory-backed store handle and cache candidate used by the cache-scheduler binary

use crate::cache::{CacheCandidate, DataStore};
use crate::errors::{CacheUpdateError, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Backing store rooted at a directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DataStore for DirectoryStore {
    /// Canonical path, so every process naming the directory differently
    /// still shares one lock file
    fn identity(&self) -> String {
        fs::canonicalize(&self.root)
            .unwrap_or_else(|_| self.root.clone())
            .display()
            .to_string()
    }

    fn probe(&self) -> Result<(), StoreError> {
        match fs::metadata(&self.root) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(StoreError::Unavailable(format!(
                "{}: {}",
                self.root.display(),
                e
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedFile {
    pub name: String,
    pub size: u64,
}

/// Snapshot of the store directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryIndex {
    pub files: Vec<IndexedFile>,
    pub total_bytes: u64,
}

/// Cache of the file names and sizes at the top level of a store directory
pub struct DirectoryIndexCache {
    root: PathBuf,
    index: RwLock<Option<Arc<DirectoryIndex>>>,
    last_updated_at: RwLock<Option<DateTime<Utc>>>,
    cancel_requested: AtomicBool,
}

impl DirectoryIndexCache {
    pub fn new(store: &DirectoryStore) -> Self {
        Self {
            root: store.root().to_path_buf(),
            index: RwLock::new(None),
            last_updated_at: RwLock::new(None),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Latest complete index, if any refresh has succeeded
    pub fn index(&self) -> Option<Arc<DirectoryIndex>> {
        self.index.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn scan(&self) -> Result<Option<DirectoryIndex>, CacheUpdateError> {
        let data_access = |e: std::io::Error| {
            CacheUpdateError::DataAccess(format!("{}: {}", self.root.display(), e))
        };

        if self.cancel_requested.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut index = DirectoryIndex::default();
        for entry in fs::read_dir(&self.root).map_err(data_access)? {
            if self.cancel_requested.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let entry = entry.map_err(data_access)?;
            let metadata = entry.metadata().map_err(data_access)?;
            if !metadata.is_file() {
                continue;
            }
            index.total_bytes += metadata.len();
            index.files.push(IndexedFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
        index.files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(index))
    }
}

impl CacheCandidate for DirectoryIndexCache {
    fn name(&self) -> &'static str {
        "directory_index"
    }

    fn update_from_store(&self, _store: &dyn DataStore) -> Result<(), CacheUpdateError> {
        // A request made before the scan started still applies to it
        let scanned = self.scan();
        self.cancel_requested.store(false, Ordering::SeqCst);

        let Some(index) = scanned? else {
            info!(root = %self.root.display(), "Directory index refresh cancelled");
            return Ok(());
        };

        debug!(
            root = %self.root.display(),
            files = index.files.len(),
            total_bytes = index.total_bytes,
            "Directory index refreshed"
        );
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(index));
        *self.last_updated_at.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        Ok(())
    }

    fn cancel_in_flight_update(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        *self.last_updated_at.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_probe_missing_directory_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path().join("missing"));

        assert!(matches!(store.probe(), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_identity_is_canonical() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();

        let direct = DirectoryStore::new(dir.path().join("data"));
        let indirect = DirectoryStore::new(dir.path().join("data/../data"));

        assert_eq!(direct.identity(), indirect.identity());
        assert!(direct.probe().is_ok());
    }

    #[test]
    fn test_refresh_indexes_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.parquet"), b"12345").unwrap();
        fs::write(dir.path().join("a.parquet"), b"123").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let store = DirectoryStore::new(dir.path());
        let cache = DirectoryIndexCache::new(&store);
        assert!(cache.last_updated_at().is_none());

        cache.update_from_store(&store).unwrap();

        let index = cache.index().unwrap();
        assert_eq!(index.total_bytes, 8);
        assert_eq!(
            index.files,
            vec![
                IndexedFile {
                    name: "a.parquet".to_string(),
                    size: 3
                },
                IndexedFile {
                    name: "b.parquet".to_string(),
                    size: 5
                },
            ]
        );
        assert!(cache.last_updated_at().is_some());
    }

    #[test]
    fn test_cancel_before_refresh_skips_scan_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.parquet"), b"123").unwrap();
        let store = DirectoryStore::new(dir.path());
        let cache = DirectoryIndexCache::new(&store);

        cache.cancel_in_flight_update();
        cache.update_from_store(&store).unwrap();
        assert!(cache.index().is_none());
        assert!(cache.last_updated_at().is_none());

        cache.update_from_store(&store).unwrap();
        assert_eq!(cache.index().unwrap().files.len(), 1);
        assert!(cache.last_updated_at().is_some());
    }

    #[test]
    fn test_refresh_of_missing_directory_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryStore::new(dir.path().join("missing"));
        let cache = DirectoryIndexCache::new(&store);

        let err = cache.update_from_store(&store).unwrap_err();

        assert!(err.is_recoverable());
        assert!(cache.last_updated_at().is_none());
    }
}
