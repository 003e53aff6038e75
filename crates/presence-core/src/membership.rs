//! Heartbeat membership.
//!
//! Every round the table is rebuilt from scratch: it starts with our own entry,
//! we broadcast a ping, and every pong that arrives before the next round is
//! merged in. A member that does not answer within a round simply is not in
//! the new table; that is the only failure detection there is.
//!
//! Changes are tracked against the previous round's table:
//! - A pong whose record differs from last round (or is new) marks its id dirty
//! - An id present last round but missing at the round boundary is dirty
//! - A change to our own attributes marks us dirty
//!
//! `Membership` does no I/O. The context drives it with `begin_round()` on each
//! heartbeat and `receive_pong()` for each pong, and publishes whatever
//! `MembershipUpdate` comes back.

use crate::member::{MemberError, find_leader};
use crate::{BusMessage, ContextId, Identity, MemberRecord, MembershipTable, MembershipUpdate};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Output of starting a heartbeat round.
#[derive(Debug)]
pub struct RoundStart {
    /// Notification for the round that just ended, if anything changed
    pub update: Option<MembershipUpdate>,
    /// Ping to broadcast for the new round
    pub ping: BusMessage,
}

/// Membership table with round-over-round change detection.
pub struct Membership {
    /// Our own attributes as advertised in pongs
    local: MemberRecord,
    /// Table for the round in progress
    table: MembershipTable,
    /// Table of the last completed round, kept only for diffing
    previous: Option<MembershipTable>,
    /// Ids changed since the last flushed notification
    dirty: HashSet<ContextId>,
    /// Number of rounds started
    rounds: u64,
}

impl Membership {
    /// Create membership for a context built at `now_ms`. The table holds our
    /// own entry from the start.
    pub fn new(
        identity: Identity,
        eligible: bool,
        attributes: Map<String, Value>,
        now_ms: u64,
    ) -> Self {
        let mut local = MemberRecord::new(identity.id, identity.created, eligible);
        // A reloaded context keeps its creation time but is refreshed now
        local.updated = now_ms.max(identity.created);
        local.attributes = attributes;

        let mut membership = Self {
            local,
            table: MembershipTable::new(),
            previous: None,
            dirty: HashSet::new(),
            rounds: 0,
        };
        membership.refresh_self_entry();
        membership
    }

    pub fn local_id(&self) -> ContextId {
        self.local.id
    }

    /// Our attributes as sent in pongs (without the `me` tag).
    pub fn local(&self) -> &MemberRecord {
        &self.local
    }

    /// Table for the round in progress.
    pub fn table(&self) -> &MembershipTable {
        &self.table
    }

    /// Table of the last completed round.
    pub fn previous(&self) -> Option<&MembershipTable> {
        self.previous.as_ref()
    }

    pub fn dirty(&self) -> &HashSet<ContextId> {
        &self.dirty
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Leader in the table for the round in progress.
    pub fn leader(&self) -> Option<ContextId> {
        find_leader(&self.table)
    }

    /// Records to consider for an election.
    ///
    /// The working table is reset at every round boundary, so a decision made
    /// early in a round would only see the pongs that arrived so far. Merge the
    /// last completed round underneath the current one; the current round wins
    /// for ids present in both.
    pub fn election_view(&self) -> MembershipTable {
        let mut view = self.previous.clone().unwrap_or_default();
        view.extend(self.table.iter().map(|(id, record)| (*id, record.clone())));
        view
    }

    /// Close the current round and open the next one.
    ///
    /// On the very first round our self-only table is reported immediately with
    /// ourselves marked dirty, so a lone context sees itself without waiting.
    pub fn begin_round(&mut self) -> RoundStart {
        let update = if self.rounds == 0 {
            self.dirty.insert(self.local.id);
            Some(self.flush())
        } else {
            if let Some(previous) = &self.previous {
                for id in previous.keys() {
                    if !self.table.contains_key(id) {
                        debug!("Member {} did not answer this round", id);
                        self.dirty.insert(*id);
                    }
                }
            }
            self.evaluate(false)
        };

        self.rounds += 1;

        let mut fresh = MembershipTable::new();
        fresh.insert(self.local.id, self.self_entry());
        self.previous = Some(std::mem::replace(&mut self.table, fresh));
        self.dirty.clear();

        trace!("Round {} started by {}", self.rounds, self.local.id);
        RoundStart {
            update,
            ping: BusMessage::ping(self.local.id),
        }
    }

    /// Build a notification if anything changed (or unconditionally with `force`).
    ///
    /// A change is a non-empty dirty set or a member count that differs from the
    /// last completed round. Flushing clears the dirty set.
    pub fn evaluate(&mut self, force: bool) -> Option<MembershipUpdate> {
        let previous_len = self.previous.as_ref().map(|p| p.len());
        let size_changed = previous_len != Some(self.table.len());

        if force || !self.dirty.is_empty() || size_changed {
            debug!(
                "Changes detected: {} dirty, {:?} -> {} members{}",
                self.dirty.len(),
                previous_len,
                self.table.len(),
                if force { " (forced)" } else { "" }
            );
            Some(self.flush())
        } else {
            None
        }
    }

    fn flush(&mut self) -> MembershipUpdate {
        MembershipUpdate {
            dirty: std::mem::take(&mut self.dirty),
            table: self.table.clone(),
        }
    }

    /// Merge a pong into the current round.
    ///
    /// Returns true if the member is new or its record differs from last round.
    pub fn receive_pong(&mut self, id: ContextId, mut attributes: MemberRecord) -> bool {
        if id == self.local.id {
            warn!("Ignoring pong carrying our own id {}", id);
            return false;
        }
        if attributes.id != id {
            warn!("Pong from {} carries record for {}; using sender id", id, attributes.id);
            attributes.id = id;
        }
        // Only our own entry may carry the `me` tag
        attributes.me = false;

        let changed = self
            .previous
            .as_ref()
            .and_then(|previous| previous.get(&id))
            != Some(&attributes);
        if changed {
            trace!("Member {} changed", id);
            self.dirty.insert(id);
        }
        self.table.insert(id, attributes);
        changed
    }

    /// Pong answering someone's ping.
    pub fn pong(&self) -> BusMessage {
        BusMessage::pong(self.local.id, self.local.clone())
    }

    /// Set our leader flag. Returns true if it changed.
    pub fn set_leader(&mut self, leader: bool, now_ms: u64) -> bool {
        if self.local.leader == leader {
            return false;
        }
        self.local.leader = leader;
        self.touch(now_ms);
        true
    }

    /// Set one of our caller attributes. Returns true if it changed.
    pub fn set_attribute(
        &mut self,
        key: &str,
        value: Value,
        now_ms: u64,
    ) -> Result<bool, MemberError> {
        let changed = self.local.set_attribute(key, value)?;
        if changed {
            self.touch(now_ms);
        }
        Ok(changed)
    }

    /// Mark an id dirty so the next round boundary reports a change.
    pub fn mark_dirty(&mut self, id: ContextId) {
        self.dirty.insert(id);
    }

    fn touch(&mut self, now_ms: u64) {
        self.local.updated = now_ms.max(self.local.updated);
        self.refresh_self_entry();
        self.dirty.insert(self.local.id);
    }

    fn refresh_self_entry(&mut self) {
        let entry = self.self_entry();
        self.table.insert(self.local.id, entry);
    }

    fn self_entry(&self) -> MemberRecord {
        let mut entry = self.local.clone();
        entry.me = true;
        entry
    }
}
