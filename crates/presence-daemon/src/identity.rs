//! Identity persisted to a JSON file.
//!
//! Each context name maps to `<state-dir>/<name>.json` holding its id,
//! creation time and the last leader it heard about. A context restarted with
//! the same name comes back with the same identity while the file exists.

use anyhow::{Context, Result};
use presence_core::{ContextId, Identity, IdentityError, IdentityStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// On-disk record for one context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedIdentity {
    pub id: ContextId,
    /// Creation time, ms since epoch
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_leader: Option<ContextId>,
}

/// Identity store for one named context.
pub struct FileIdentityStore {
    /// Path to the storage file.
    path: PathBuf,
    /// In-memory cache, filled on first access.
    cached: Mutex<Option<PersistedIdentity>>,
}

impl FileIdentityStore {
    /// Store for context `name` under `state_dir`. Nothing is read until the
    /// identity is first requested.
    pub fn new(state_dir: &Path, name: &str) -> Self {
        Self {
            path: state_dir.join(format!("{}.json", name)),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record from disk, if the file exists.
    pub fn load(&self) -> Result<Option<PersistedIdentity>, IdentityError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| IdentityError::Storage(format!("{:?}: {}", self.path, e)))?;
        let record = serde_json::from_str(&contents)
            .map_err(|e| IdentityError::Corrupt(format!("{:?}: {}", self.path, e)))?;
        Ok(Some(record))
    }

    fn save(&self, record: &PersistedIdentity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {:?}", parent))?;
        }
        let contents = serde_json::to_string_pretty(record)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write identity file: {:?}", self.path))?;
        Ok(())
    }

    fn cached(&self) -> std::sync::MutexGuard<'_, Option<PersistedIdentity>> {
        self.cached.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IdentityStore for FileIdentityStore {
    fn get_or_create_identity(&self) -> Result<Identity, IdentityError> {
        let mut cached = self.cached();
        if cached.is_none() {
            *cached = self.load()?;
        }
        if let Some(record) = *cached {
            debug!("Loaded identity {} from {:?}", record.id, self.path);
            return Ok(Identity {
                id: record.id,
                created: record.created,
            });
        }

        let identity = Identity::generate(presence_core::now_ms());
        let record = PersistedIdentity {
            id: identity.id,
            created: identity.created,
            last_leader: None,
        };
        self.save(&record)
            .map_err(|e| IdentityError::Storage(format!("{:#}", e)))?;
        info!("Created identity {} at {:?}", identity.id, self.path);
        *cached = Some(record);
        Ok(identity)
    }

    fn set_last_known_leader(&self, id: ContextId) -> Result<(), IdentityError> {
        let mut cached = self.cached();
        if cached.is_none() {
            *cached = self.load()?;
        }
        let Some(record) = cached.as_mut() else {
            return Err(IdentityError::Storage(format!(
                "{:?}: no identity to attach a leader to",
                self.path
            )));
        };
        if record.last_leader == Some(id) {
            return Ok(());
        }
        record.last_leader = Some(id);
        let record = *record;
        self.save(&record)
            .map_err(|e| IdentityError::Storage(format!("{:#}", e)))
    }

    fn last_known_leader(&self) -> Option<ContextId> {
        let mut cached = self.cached();
        if cached.is_none() {
            *cached = self.load().ok().flatten();
        }
        cached.and_then(|record| record.last_leader)
    }
}
