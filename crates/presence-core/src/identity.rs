//! Identity of the local context.
//!
//! A context gets its id and creation time once and keeps them for its
//! lifetime, including across a reload of the same context. The store also
//! remembers the last leader it heard about; that value is advisory and never
//! used for correctness.

use crate::ContextId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity storage failed: {0}")]
    Storage(String),

    #[error("Stored identity is corrupt: {0}")]
    Corrupt(String),
}

/// Stable identity of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: ContextId,
    /// Creation time, ms since epoch
    pub created: u64,
}

impl Identity {
    /// Mint a fresh identity created at `now_ms`.
    pub fn generate(now_ms: u64) -> Self {
        Self {
            id: ContextId::generate(),
            created: now_ms,
        }
    }
}

/// Key-value storage scoped to one context's lifetime.
pub trait IdentityStore: Send + Sync {
    /// Return the stored identity, creating and storing one on first use.
    fn get_or_create_identity(&self) -> Result<Identity, IdentityError>;

    /// Remember the most recent leader. Best effort.
    fn set_last_known_leader(&self, id: ContextId) -> Result<(), IdentityError>;

    /// The most recently remembered leader.
    fn last_known_leader(&self) -> Option<ContextId>;
}

#[derive(Debug, Default)]
struct SessionState {
    identity: Option<Identity>,
    last_leader: Option<ContextId>,
}

/// In-memory identity store, the equivalent of per-tab session storage.
///
/// Clones share state, so handing a clone to a new `PresenceContext` models a
/// reload of the same context: it comes back with the same id and creation time.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    state: Arc<Mutex<SessionState>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with an identity.
    pub fn with_identity(identity: Identity) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                identity: Some(identity),
                last_leader: None,
            })),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get_or_create_identity(&self) -> Result<Identity, IdentityError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(*state
            .identity
            .get_or_insert_with(|| Identity::generate(crate::now_ms())))
    }

    fn set_last_known_leader(&self, id: ContextId) -> Result<(), IdentityError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_leader = Some(id);
        Ok(())
    }

    fn last_known_leader(&self) -> Option<ContextId> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_leader
    }
}
