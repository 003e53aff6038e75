//! presence-core: Presence and leader election between sibling execution
//! contexts (browser tabs of one origin, worker processes on one host).
//!
//! This crate provides:
//! - A heartbeat membership table with change detection (`Membership`)
//! - Leader election layered on membership (`Election`)
//! - `PresenceContext`, which wires both to their collaborators
//! - `Bus`, `LockService`, `IdentityStore` and `Scheduler` trait abstractions
//!
//! Nothing here performs I/O or owns a clock. Hosts deliver bus messages and
//! timer firings to the context and pass the current time in.

pub mod bus;
pub mod config;
pub mod context;
pub mod context_id;
pub mod election;
pub mod events;
pub mod identity;
pub mod lock;
pub mod member;
pub mod membership;
pub mod message;
pub mod schedule;

#[cfg(test)]
pub mod sim;

pub use bus::{Bus, BusError};
pub use config::PresenceConfig;
pub use context::{Collaborators, ContextOptions, PresenceContext};
pub use context_id::{ContextId, ContextIdError};
pub use election::Election;
pub use events::{EventBus, EventError, EventKind, MembershipUpdate, PresenceEvent, Subscription};
pub use identity::{Identity, IdentityError, IdentityStore, MemoryIdentityStore};
pub use lock::{LocalLocks, LockError, LockGuard, LockService};
pub use member::{MemberError, MemberRecord, MembershipTable, Role};
pub use membership::Membership;
pub use message::{BusMessage, Inbound};
pub use schedule::{Scheduler, TimerKind};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
