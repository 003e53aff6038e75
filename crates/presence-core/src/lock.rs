//! Advisory locks shared by every context of one origin.
//!
//! Locks are probe-only: `try_acquire` either returns a guard immediately or
//! reports the lock as taken. Nothing ever waits for a lock. The guard
//! releases the lock when dropped.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock I/O failed for '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Held advisory lock. Dropping it releases the lock.
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Create a guard that runs `release` exactly once when dropped.
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Non-blocking named mutual exclusion across contexts.
pub trait LockService: Send + Sync {
    /// Try to take `name`. `Ok(None)` means another holder has it.
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError>;
}

/// Lock table shared by contexts living in one process.
///
/// Clone the handle to share it; all clones see the same locks.
#[derive(Clone, Default)]
pub struct LocalLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a lock is currently held by anyone.
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

impl LockService for LocalLocks {
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        drop(held);

        let table = Arc::clone(&self.held);
        let owned = name.to_string();
        Ok(Some(LockGuard::new(name, move || {
            table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&owned);
        })))
    }
}
