//! Member records: what one context advertises about itself.

use crate::ContextId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Membership table for one round, keyed by context id.
pub type MembershipTable = HashMap<ContextId, MemberRecord>;

/// Field names owned by the protocol; callers cannot set them as attributes.
pub const RESERVED_ATTRIBUTES: [&str; 6] = ["id", "created", "updated", "leader", "eligible", "me"];

#[derive(Debug, Error)]
pub enum MemberError {
    #[error("Attribute '{0}' is reserved by the presence protocol")]
    ReservedAttribute(String),
}

/// Attributes of one member, as carried in `pong` messages.
///
/// Records are compared structurally from round to round; any difference in
/// any field (including caller attributes) counts as a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    /// Stable identifier of the context
    pub id: ContextId,
    /// Creation time of the context (ms since epoch), never changes
    pub created: u64,
    /// Last time the context changed its own attributes (ms since epoch)
    pub updated: u64,
    /// Whether this member currently believes it is the leader
    #[serde(default)]
    pub leader: bool,
    /// Whether this member may ever become leader
    #[serde(default = "default_true")]
    pub eligible: bool,
    /// Set only on the local context's own entry in its own table
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub me: bool,
    /// Caller supplied attributes
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl MemberRecord {
    /// Create a record for a context that has just come into existence.
    pub fn new(id: ContextId, created: u64, eligible: bool) -> Self {
        Self {
            id,
            created,
            updated: created,
            leader: false,
            eligible,
            me: false,
            attributes: Map::new(),
        }
    }

    /// Set a caller attribute, rejecting protocol-owned names.
    ///
    /// Returns true if the stored value changed.
    pub fn set_attribute(&mut self, key: &str, value: Value) -> Result<bool, MemberError> {
        if RESERVED_ATTRIBUTES.contains(&key) {
            return Err(MemberError::ReservedAttribute(key.to_string()));
        }
        if self.attributes.get(key) == Some(&value) {
            return Ok(false);
        }
        self.attributes.insert(key.to_string(), value);
        Ok(true)
    }

    /// Election order: oldest first, lower id first on equal timestamps.
    pub fn election_key(&self) -> (u64, ContextId) {
        (self.created, self.id)
    }
}

/// Leadership role of the local context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Eligible and not currently leader
    Candidate,
    /// Won an election or was named by an `elect` announcement
    Leader,
    /// Can never lead; still takes part in membership
    Ineligible,
}

/// Find the leader recorded in a table.
///
/// If the table transiently holds several leaders, the oldest one is returned
/// so that every context reports the same answer for the same table.
pub fn find_leader(table: &MembershipTable) -> Option<ContextId> {
    table
        .values()
        .filter(|record| record.leader)
        .min_by_key(|record| record.election_key())
        .map(|record| record.id)
}

/// Pick the oldest eligible member from a set of records.
pub fn oldest_eligible<'a>(
    records: impl IntoIterator<Item = &'a MemberRecord>,
) -> Option<ContextId> {
    let mut candidates: Vec<&MemberRecord> = records.into_iter().collect();
    candidates.sort_by_key(|record| record.election_key());
    candidates
        .into_iter()
        .find(|record| record.eligible)
        .map(|record| record.id)
}
