//! Event infrastructure for presence.
//!
//! Provides `PresenceEvent` for membership updates and pass-through bus
//! messages, and `EventBus` for subscriptions. The set of event kinds is
//! closed; string names are only accepted at the registration boundary for
//! hosts that configure subscribers by name.

use crate::{ContextId, MembershipTable};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown event handler: {0} not supported")]
    UnknownEvent(String),
}

/// Kinds of event a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Membership changed (or a forced notification)
    Update,
    /// A non-heartbeat message arrived on the bus
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(Self::Update),
            "message" => Ok(Self::Message),
            other => Err(EventError::UnknownEvent(other.to_string())),
        }
    }
}

/// Snapshot handed to `update` subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipUpdate {
    /// Ids whose record changed, appeared or disappeared since the last flush
    pub dirty: HashSet<ContextId>,
    /// Current membership table, always including the local context
    pub table: MembershipTable,
}

impl MembershipUpdate {
    /// Leader recorded in this snapshot, if any.
    pub fn leader(&self) -> Option<ContextId> {
        crate::member::find_leader(&self.table)
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Update(MembershipUpdate),
    Message(Value),
}

impl PresenceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Update(_) => EventKind::Update,
            Self::Message(_) => EventKind::Message,
        }
    }
}

type Callback = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Subscription {
    /// Keep the handler registered for the lifetime of the bus.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing presence events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, EventKind, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one kind of event. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: EventKind,
        callback: impl Fn(&PresenceEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, kind, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Subscribe by event name.
    ///
    /// An unknown name is a configuration error: it is logged and nothing is
    /// registered.
    pub fn subscribe_named(
        self: &Arc<Self>,
        name: &str,
        callback: impl Fn(&PresenceEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, EventError> {
        match name.parse::<EventKind>() {
            Ok(kind) => Ok(self.subscribe(kind, callback)),
            Err(e) => {
                error!("{}", e);
                Err(e)
            }
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit never holds the lock while a callback runs, so this cannot deadlock
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _, _)| *i != id);
    }

    /// Remove every subscriber of one kind.
    pub fn clear(&self, kind: EventKind) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, k, _)| *k != kind);
    }

    /// Number of subscribers registered for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    /// Emit an event to every subscriber of its kind.
    ///
    /// A panicking subscriber is logged and skipped; the remaining subscribers
    /// still run. Returns the number of subscribers that failed.
    pub fn emit(&self, event: &PresenceEvent) -> usize {
        let kind = event.kind();
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect();

        let mut failures = 0;
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                failures += 1;
                error!("{} subscriber failed: {}", kind, panic_message(&panic));
            }
        }
        failures
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
