//! Leader election on top of heartbeat membership.
//!
//! Purely reactive. On every membership update with no leader in the table,
//! an eligible context tries to run an election:
//! 1. The local election guard must be free (one attempt per context at a time)
//! 2. The shared `election` lock must be free (one attempt per origin at a time)
//! 3. After the decision delay the oldest eligible member is picked
//! 4. The winner is announced under the shared `assert-leader` lock with an
//!    `elect` broadcast
//!
//! Receiving `elect` promotes the named context and demotes everyone else.
//!
//! Contention at either lock is expected and never an error: the loser marks
//! itself dirty so the next heartbeat round re-evaluates, and the protocol
//! converges on the round after a leader shows up in the table.

use crate::identity::IdentityStore;
use crate::lock::{LockGuard, LockService};
use crate::member::oldest_eligible;
use crate::schedule::{Scheduler, TimerKind};
use crate::{Bus, BusMessage, ContextId, Membership, MembershipUpdate, PresenceConfig, Role};
use tracing::{debug, error, info, warn};

/// Collaborators an election step needs, borrowed from the owning context.
pub(crate) struct ElectionEnv<'a> {
    pub membership: &'a mut Membership,
    pub config: &'a PresenceConfig,
    pub locks: &'a dyn LockService,
    pub identity: &'a dyn IdentityStore,
    pub bus: &'a dyn Bus,
    pub scheduler: &'a mut dyn Scheduler,
    pub now_ms: u64,
}

/// An election this context is currently driving.
#[derive(Debug)]
struct Attempt {
    /// Shared election lock, held until the decision is made
    _lock: LockGuard,
    started_ms: u64,
}

/// Election state for one context.
pub struct Election {
    eligible: bool,
    /// The election guard: `Some` while an attempt is in progress
    attempt: Option<Attempt>,
    elections_won: u64,
}

impl Election {
    pub fn new(eligible: bool) -> Self {
        Self {
            eligible,
            attempt: None,
            elections_won: 0,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    /// True while this context holds the election lock and waits to decide.
    pub fn in_progress(&self) -> bool {
        self.attempt.is_some()
    }

    /// Number of times this context won an election it decided itself.
    pub fn elections_won(&self) -> u64 {
        self.elections_won
    }

    /// Leadership role given the current local attributes.
    pub fn role(&self, membership: &Membership) -> Role {
        if !self.eligible {
            Role::Ineligible
        } else if membership.local().leader {
            Role::Leader
        } else {
            Role::Candidate
        }
    }

    /// React to a membership update.
    ///
    /// Returns a forced update to publish if this step made us leader.
    pub(crate) fn on_update(
        &mut self,
        update: &MembershipUpdate,
        env: &mut ElectionEnv<'_>,
    ) -> Option<MembershipUpdate> {
        if update.leader().is_some() || !self.eligible {
            return None;
        }

        if let Some(attempt) = &self.attempt {
            warn!(
                "Election already in progress since {}ms; dropping duplicate attempt",
                attempt.started_ms
            );
            return None;
        }

        let lock = match env.locks.try_acquire(&env.config.election_lock) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!("Another context is running an election");
                env.membership.mark_dirty(env.membership.local_id());
                return None;
            }
            Err(e) => {
                error!("Election lock probe failed: {}", e);
                env.membership.mark_dirty(env.membership.local_id());
                return None;
            }
        };

        // A faster context may have settled it while we were getting the lock
        if let Some(leader) = env.membership.leader() {
            debug!("Leader {} appeared before election started", leader);
            return self.announce(leader, env);
        }

        debug!(
            "No leader among {} members; deciding in {:?}",
            update.table.len(),
            env.config.election_delay
        );
        self.attempt = Some(Attempt {
            _lock: lock,
            started_ms: env.now_ms,
        });
        env.scheduler
            .schedule(TimerKind::Decision, env.config.election_delay);
        None
    }

    /// The decision delay expired: pick and announce the winner.
    pub(crate) fn on_decision_timer(
        &mut self,
        env: &mut ElectionEnv<'_>,
    ) -> Option<MembershipUpdate> {
        // Taking the attempt releases the election lock when this step returns
        let Some(attempt) = self.attempt.take() else {
            debug!("Decision timer fired with no election in progress");
            return None;
        };

        let view = env.membership.election_view();
        let Some(winner) = oldest_eligible(view.values()) else {
            warn!("No eligible member among {} to elect", view.len());
            drop(attempt);
            return None;
        };

        info!(
            "Election decided after {}ms: {} of {} members",
            env.now_ms.saturating_sub(attempt.started_ms),
            winner,
            view.len()
        );
        if winner == env.membership.local_id() {
            self.elections_won += 1;
        }
        let update = self.announce(winner, env);
        drop(attempt);
        update
    }

    /// Announce `winner` to every member.
    fn announce(
        &mut self,
        winner: ContextId,
        env: &mut ElectionEnv<'_>,
    ) -> Option<MembershipUpdate> {
        let _assert = match env.locks.try_acquire(&env.config.assert_lock) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!("Another announcement is in flight; not announcing {}", winner);
                env.membership.mark_dirty(env.membership.local_id());
                return None;
            }
            Err(e) => {
                error!("Assert-leader lock probe failed: {}", e);
                env.membership.mark_dirty(env.membership.local_id());
                return None;
            }
        };

        let update = if winner == env.membership.local_id() {
            self.become_leader(env)
        } else {
            None
        };

        match BusMessage::elect(winner).to_json() {
            Ok(data) => {
                if let Err(e) = env.bus.send(&data) {
                    warn!("Failed to broadcast elect for {}: {}", winner, e);
                }
            }
            Err(e) => error!("Failed to encode elect for {}: {}", winner, e),
        }

        // Out-of-cycle heartbeat so everyone sees the result sooner
        env.scheduler
            .schedule(TimerKind::Heartbeat, std::time::Duration::ZERO);
        update
    }

    /// Handle an `elect` announcement from another context.
    pub(crate) fn on_elect(
        &mut self,
        id: ContextId,
        env: &mut ElectionEnv<'_>,
    ) -> Option<MembershipUpdate> {
        if id == env.membership.local_id() {
            if !self.eligible {
                warn!("Ignoring election of {}: context is not eligible", id);
                return None;
            }
            return self.become_leader(env);
        }

        // Demote unconditionally, whether or not we were leader
        if env.membership.set_leader(false, env.now_ms) {
            info!("Stepping down; {} was elected", id);
        }
        if let Err(e) = env.identity.set_last_known_leader(id) {
            warn!("Could not record last known leader {}: {}", id, e);
        }
        None
    }

    fn become_leader(&mut self, env: &mut ElectionEnv<'_>) -> Option<MembershipUpdate> {
        let id = env.membership.local_id();
        if env.membership.set_leader(true, env.now_ms) {
            info!("Became leader: {}", id);
        }
        if let Err(e) = env.identity.set_last_known_leader(id) {
            warn!("Could not record last known leader {}: {}", id, e);
        }
        env.membership.evaluate(true)
    }

    /// Abandon any election in progress, releasing the election lock.
    pub(crate) fn abandon(&mut self) {
        if self.attempt.take().is_some() {
            debug!("Abandoned election in progress");
        }
    }
}
