//! In-process broadcast hub.
//!
//! Stands in for a browser broadcast channel: every context that joins a
//! channel gets a handle to post on it and a receiver for what others post.
//! A sender never receives its own messages.

use presence_core::{Bus, BusError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

type Member = (u64, mpsc::UnboundedSender<Vec<u8>>);

#[derive(Default)]
struct HubState {
    next_member: u64,
    channels: HashMap<String, Vec<Member>>,
}

/// Broadcast hub shared by all contexts in this process.
///
/// Clone the hub to share it; clones see the same channels.
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `channel`. Returns the handle to post with and the receiver of
    /// everything other members post.
    pub fn join(&self, channel: &str) -> (HubHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_member += 1;
        let member = state.next_member;
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((member, tx));
        debug!("Member {} joined channel '{}'", member, channel);

        let handle = HubHandle {
            hub: self.clone(),
            channel: channel.to_string(),
            member,
        };
        (handle, rx)
    }

    /// Number of members currently on `channel`.
    pub fn member_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }

    fn leave(&self, channel: &str, member: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = state.channels.get_mut(channel) {
            members.retain(|(id, _)| *id != member);
            if members.is_empty() {
                state.channels.remove(channel);
            }
        }
        debug!("Member {} left channel '{}'", member, channel);
    }
}

/// One member's posting handle. Dropping it leaves the channel.
pub struct HubHandle {
    hub: LocalHub,
    channel: String,
    member: u64,
}

impl Bus for HubHandle {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn send(&self, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.hub.state.lock().unwrap_or_else(|e| e.into_inner());
        let closed = || BusError::Closed(self.channel.clone());
        let members = state.channels.get_mut(&self.channel).ok_or_else(closed)?;
        if !members.iter().any(|(id, _)| *id == self.member) {
            return Err(closed());
        }

        // Receivers that went away are pruned as we go
        members.retain(|(id, tx)| *id == self.member || tx.send(data.to_vec()).is_ok());
        trace!(
            "Member {} posted {} bytes to {} other(s)",
            self.member,
            data.len(),
            members.len() - 1
        );
        Ok(())
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        self.hub.leave(&self.channel, self.member);
    }
}
