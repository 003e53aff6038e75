//! Advisory locks backed by lock files.
//!
//! Each lock name maps to `<dir>/<name>.lock`, probed with a non-blocking
//! exclusive `flock`. The OS releases the lock if the holder dies, so a
//! crashed process never leaves a lock behind. Works across processes
//! sharing the directory.

use anyhow::{Context, Result};
use fs2::FileExt;
use presence_core::{LockError, LockGuard, LockService};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Directory of lock files.
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
}

impl FileLocks {
    /// Use `dir` for lock files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create lock directory: {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing lock `name`.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }
}

impl LockService for FileLocks {
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        let io_error = |source| LockError::Io {
            name: name.to_string(),
            source,
        };

        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                trace!("Acquired lock file {:?}", path);
                let owned = name.to_string();
                Ok(Some(LockGuard::new(name, move || {
                    if let Err(e) = FileExt::unlock(&file) {
                        warn!("Failed to unlock '{}': {}", owned, e);
                    }
                })))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }
}
