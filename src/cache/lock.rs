//! Partition locking
//!
//! Commits to one partition are serialized twice: an in-process async mutex per
//! partition keeps tasks of this process in line without blocking worker
//! threads, and an advisory file lock (fd-lock) on `<partition>/.lock` keeps
//! other processes sharing the cache directory out.

use fd_lock::RwLock;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::CacheError;

/// Name of the lock file inside a partition directory
pub const LOCK_FILE_NAME: &str = ".lock";

/// Registry of in-process partition mutexes
#[derive(Debug, Default)]
pub struct PartitionLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PartitionLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive in-process access to the partition at `dir`
    pub async fn lock(&self, dir: &Path) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(dir.to_path_buf()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

fn open_lock_file(dir: &Path) -> Result<RwLock<std::fs::File>, CacheError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CacheError::Io(format!("Failed to create {}: {e}", dir.display())))?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE_NAME))
        .map_err(|e| CacheError::Lock(format!("Failed to open lock file: {e}")))?;
    Ok(RwLock::new(file))
}

/// Run `f` holding the exclusive file lock of the partition at `dir`
///
/// Blocks until the lock is available; call from a blocking context.
pub fn with_exclusive<T>(dir: &Path, f: impl FnOnce() -> Result<T, CacheError>) -> Result<T, CacheError> {
    let mut lock = open_lock_file(dir)?;
    debug!(partition = %dir.display(), "Acquiring exclusive partition lock");
    let _guard = lock
        .write()
        .map_err(|e| CacheError::Lock(format!("Failed to acquire write lock: {e}")))?;
    f()
}

/// Run `f` holding a shared file lock of the partition at `dir`
pub fn with_shared<T>(dir: &Path, f: impl FnOnce() -> Result<T, CacheError>) -> Result<T, CacheError> {
    let lock = open_lock_file(dir)?;
    let _guard = lock
        .read()
        .map_err(|e| CacheError::Lock(format!("Failed to acquire read lock: {e}")))?;
    f()
}
