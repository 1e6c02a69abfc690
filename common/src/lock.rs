// Advisory lock file shared by every process refreshing the same backing store

use crate::errors::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const LOCK_FILE_PREFIX: &str = "cache-update-";
const LOCK_FILE_SUFFIX: &str = ".lock";

/// Owner details written into the lock file for operators.
///
/// The content is informational only: acquisition relies solely on the
/// filesystem's exclusive-create semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Filesystem-backed mutual exclusion keyed by backing-store identity.
///
/// The manager keeps no lock state in memory. Two managers built from the
/// same directory and identity (in this process or another one) resolve to
/// the same file and therefore exclude each other.
#[derive(Debug, Clone)]
pub struct LockFileManager {
    path: PathBuf,
}

impl LockFileManager {
    /// Resolve the lock file for `store_identity` inside `lock_dir`
    pub fn new(lock_dir: impl AsRef<Path>, store_identity: &str) -> Self {
        let path = lock_dir.as_ref().join(Self::lock_file_name(store_identity));
        Self { path }
    }

    /// Deterministic file name derived from the store identity
    pub fn lock_file_name(store_identity: &str) -> String {
        let digest = Sha256::digest(store_identity.as_bytes());
        format!(
            "{}{}{}",
            LOCK_FILE_PREFIX,
            hex::encode(&digest[..8]),
            LOCK_FILE_SUFFIX
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the lock file if absent.
    ///
    /// Returns `true` when this call created the file (the caller now owns the
    /// lock) and `false` when it already existed.
    pub fn try_acquire(&self) -> Result<bool, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(lock_path = %self.path.display(), "Lock file already present");
                return Ok(false);
            }
            Err(e) => return Err(LockError::io(&self.path, e)),
        };

        let owner = LockOwner {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let written = serde_json::to_vec(&owner)
            .map_err(std::io::Error::from)
            .and_then(|bytes| file.write_all(&bytes));
        if let Err(e) = written {
            // Ownership comes from the create, not the content
            warn!(
                lock_path = %self.path.display(),
                error = %e,
                "Failed to record lock owner"
            );
        }

        info!(lock_path = %self.path.display(), pid = owner.pid, "Lock acquired");
        Ok(true)
    }

    /// Acquire the lock and wrap it in a guard that releases on drop
    pub fn try_acquire_guard(&self) -> Result<Option<LockFileGuard>, LockError> {
        if self.try_acquire()? {
            Ok(Some(LockFileGuard {
                manager: self.clone(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Remove the lock file. Removing an absent lock is not an error.
    pub fn release(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(lock_path = %self.path.display(), "Lock released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(lock_path = %self.path.display(), "Lock already absent");
                Ok(())
            }
            Err(e) => Err(LockError::io(&self.path, e)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Time elapsed since the lock file was last modified
    pub fn age_of(&self) -> Result<Duration, LockError> {
        let metadata = fs::metadata(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => LockError::NotFound(self.path.clone()),
            _ => LockError::io(&self.path, e),
        })?;
        let modified = metadata
            .modified()
            .map_err(|e| LockError::io(&self.path, e))?;

        // A timestamp in the future (clock skew between hosts) counts as fresh
        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO))
    }

    /// Owner recorded in the lock file, if the lock is held and readable
    pub fn owner_info(&self) -> Result<Option<LockOwner>, LockError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::io(&self.path, e)),
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }
}

/// Releases the lock file when dropped unless released explicitly first
#[derive(Debug)]
pub struct LockFileGuard {
    manager: LockFileManager,
    released: bool,
}

impl LockFileGuard {
    pub fn path(&self) -> &Path {
        self.manager.path()
    }

    /// Release now and surface the I/O error instead of logging it
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager.release()
    }
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release() {
            warn!(
                lock_path = %self.manager.path().display(),
                error = %e,
                "Failed to release lock on drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockFileManager {
        LockFileManager::new(dir.path(), "postgres://localhost/observations")
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir);
        let second = manager(&dir);

        assert!(first.try_acquire().unwrap());
        assert!(!second.try_acquire().unwrap());
        assert!(second.is_held());
    }

    #[test]
    fn test_release_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);

        assert!(lock.try_acquire().unwrap());
        lock.release().unwrap();
        assert!(!lock.is_held());
        assert!(lock.try_acquire().unwrap());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);

        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_age_of_missing_lock_is_not_found() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);

        assert!(matches!(lock.age_of(), Err(LockError::NotFound(_))));
    }

    #[test]
    fn test_age_of_grows_after_acquire() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);
        assert!(lock.try_acquire().unwrap());

        std::thread::sleep(Duration::from_millis(20));
        let age = lock.age_of().unwrap();
        assert!(age < Duration::from_secs(60));
    }

    #[test]
    fn test_lock_file_name_is_deterministic() {
        let a = LockFileManager::lock_file_name("store-a");
        let b = LockFileManager::lock_file_name("store-a");
        let c = LockFileManager::lock_file_name("store-b");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(LOCK_FILE_PREFIX));
        assert!(a.ends_with(LOCK_FILE_SUFFIX));
    }

    #[test]
    fn test_acquire_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let lock = LockFileManager::new(dir.path().join("nested/locks"), "store");

        assert!(lock.try_acquire().unwrap());
        assert!(lock.path().exists());
    }

    #[test]
    fn test_owner_info_records_pid() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);
        assert_eq!(lock.owner_info().unwrap(), None);

        assert!(lock.try_acquire().unwrap());
        let owner = lock.owner_info().unwrap().unwrap();
        assert_eq!(owner.pid, std::process::id());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);

        {
            let guard = lock.try_acquire_guard().unwrap();
            assert!(guard.is_some());
            assert!(lock.is_held());
            assert!(lock.try_acquire_guard().unwrap().is_none());
        }

        assert!(!lock.is_held());
    }

    #[test]
    fn test_guard_explicit_release() {
        let dir = TempDir::new().unwrap();
        let lock = manager(&dir);

        let guard = lock.try_acquire_guard().unwrap().unwrap();
        assert_eq!(guard.path(), lock.path());
        guard.release().unwrap();
        assert!(!lock.is_held());
    }
}
