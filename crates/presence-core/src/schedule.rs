//! Timer scheduling seam.
//!
//! A context owns exactly two kinds of single-shot timer. The host implements
//! [`Scheduler`] and calls
//! [`PresenceContext::on_timer`](crate::PresenceContext::on_timer) when one
//! fires. Scheduling a kind replaces whatever task of that kind is pending, so
//! at most one task per kind is ever outstanding.

use std::time::Duration;

/// Purpose of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Next heartbeat round
    Heartbeat,
    /// Election decision delay
    Decision,
}

/// Host-provided single-shot timers.
pub trait Scheduler: Send {
    /// Fire `timer` once after `after`, cancelling any pending task of the same kind.
    fn schedule(&mut self, timer: TimerKind, after: Duration);

    /// Cancel the pending task of this kind, if any.
    fn cancel(&mut self, timer: TimerKind);
}
