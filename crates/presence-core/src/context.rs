//! One participating context: membership plus election, wired to its
//! collaborators.
//!
//! `PresenceContext` is single-threaded and does no I/O of its own. The host
//! feeds it bus deliveries and timer firings one at a time; everything the
//! context wants to do goes out through the `Bus`, `LockService`,
//! `IdentityStore` and `Scheduler` it was built with.

use crate::election::{Election, ElectionEnv};
use crate::events::{EventBus, EventError, EventKind, PresenceEvent, Subscription};
use crate::identity::{Identity, IdentityError, IdentityStore};
use crate::lock::LockService;
use crate::member::MemberError;
use crate::message::Inbound;
use crate::schedule::{Scheduler, TimerKind};
use crate::{
    Bus, BusMessage, ContextId, Membership, MembershipTable, MembershipUpdate, PresenceConfig,
    Role,
};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Borrow the collaborators an election step needs from the context's fields.
macro_rules! election_env {
    ($ctx:ident, $now:expr) => {
        ElectionEnv {
            membership: &mut $ctx.membership,
            config: &$ctx.config,
            locks: $ctx.locks.as_ref(),
            identity: $ctx.identity_store.as_ref(),
            bus: $ctx.bus.as_ref(),
            scheduler: $ctx.scheduler.as_mut(),
            now_ms: $now,
        }
    };
}

/// Construction-time options for a context.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub config: PresenceConfig,
    /// Can this context ever become leader
    pub ineligible: bool,
    /// Initial caller attributes
    pub attributes: Map<String, Value>,
}

impl ContextOptions {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Mark the context as never eligible for leadership.
    pub fn ineligible(mut self) -> Self {
        self.ineligible = true;
        self
    }

    /// Add an initial caller attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// External services a context is built on.
pub struct Collaborators {
    pub bus: Box<dyn Bus>,
    pub locks: Arc<dyn LockService>,
    pub identity: Arc<dyn IdentityStore>,
    pub scheduler: Box<dyn Scheduler>,
}

/// A context taking part in presence and leader election.
pub struct PresenceContext {
    config: PresenceConfig,
    identity: Identity,
    membership: Membership,
    election: Election,
    events: Arc<EventBus>,
    bus: Box<dyn Bus>,
    locks: Arc<dyn LockService>,
    identity_store: Arc<dyn IdentityStore>,
    scheduler: Box<dyn Scheduler>,
    running: bool,
}

impl PresenceContext {
    /// Build a context at `now_ms`. Its identity comes from the identity store.
    pub fn new(
        options: ContextOptions,
        collaborators: Collaborators,
        now_ms: u64,
    ) -> Result<Self, IdentityError> {
        let identity = collaborators.identity.get_or_create_identity()?;
        for key in crate::member::RESERVED_ATTRIBUTES {
            if options.attributes.contains_key(key) {
                warn!("Dropping reserved attribute '{}' from context options", key);
            }
        }
        let mut attributes = options.attributes;
        attributes.retain(|key, _| !crate::member::RESERVED_ATTRIBUTES.contains(&key.as_str()));

        let eligible = !options.ineligible;
        debug!(
            "Context {} (created {}) joining channel '{}'{}",
            identity.id,
            identity.created,
            collaborators.bus.channel(),
            if eligible { "" } else { " as ineligible" }
        );

        Ok(Self {
            config: options.config,
            identity,
            membership: Membership::new(identity, eligible, attributes, now_ms),
            election: Election::new(eligible),
            events: Arc::new(EventBus::new()),
            bus: collaborators.bus,
            locks: collaborators.locks,
            identity_store: collaborators.identity,
            scheduler: collaborators.scheduler,
            running: false,
        })
    }

    // ========== Queries ==========

    pub fn id(&self) -> ContextId {
        self.identity.id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Membership table for the round in progress.
    pub fn table(&self) -> &MembershipTable {
        self.membership.table()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Leader visible in the current round, if any.
    pub fn leader(&self) -> Option<ContextId> {
        self.membership.leader()
    }

    /// Leader as of the last completed round, or ourselves if we lead.
    ///
    /// The table of the round in progress may not hold every pong yet, so this
    /// is the steadier answer for observers.
    pub fn observed_leader(&self) -> Option<ContextId> {
        if self.is_leader() {
            return Some(self.id());
        }
        self.membership.previous().and_then(crate::member::find_leader)
    }

    pub fn is_leader(&self) -> bool {
        self.membership.local().leader
    }

    pub fn role(&self) -> Role {
        self.election.role(&self.membership)
    }

    pub fn election_in_progress(&self) -> bool {
        self.election.in_progress()
    }

    pub fn last_known_leader(&self) -> Option<ContextId> {
        self.identity_store.last_known_leader()
    }

    // ========== Subscriptions ==========

    /// Register a handler for one event kind.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&PresenceEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(kind, handler)
    }

    /// Register a handler by event name (`"update"` or `"message"`).
    ///
    /// An unknown name is logged and nothing is registered.
    pub fn on_named(
        &self,
        name: &str,
        handler: impl Fn(&PresenceEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, EventError> {
        self.events.subscribe_named(name, handler)
    }

    /// Remove every handler of one kind.
    pub fn off_all(&self, kind: EventKind) {
        self.events.clear(kind);
    }

    // ========== Lifecycle ==========

    /// Begin heartbeating. The first round reports our own presence at once.
    pub fn start(&mut self, now_ms: u64) {
        if self.running {
            debug!("Context {} already started", self.id());
            return;
        }
        info!("Context {} starting", self.id());
        self.running = true;
        self.run_round(now_ms);
    }

    /// Stop heartbeating, give up leadership and abandon any election in progress.
    ///
    /// Peers drop this context after one silent round. A stopped context
    /// ignores the bus; start it again to rejoin.
    pub fn stop(&mut self, now_ms: u64) {
        if !self.running {
            return;
        }
        info!("Context {} stopping", self.id());
        self.running = false;
        self.scheduler.cancel(TimerKind::Heartbeat);
        self.scheduler.cancel(TimerKind::Decision);
        self.election.abandon();
        self.membership.set_leader(false, now_ms);
    }

    /// A scheduled timer fired.
    pub fn on_timer(&mut self, timer: TimerKind, now_ms: u64) {
        if !self.running {
            trace!("Ignoring {:?} timer on stopped context", timer);
            return;
        }
        match timer {
            TimerKind::Heartbeat => self.run_round(now_ms),
            TimerKind::Decision => {
                let forced = self.election.on_decision_timer(&mut election_env!(self, now_ms));
                if let Some(update) = forced {
                    self.publish(update, now_ms);
                }
            }
        }
    }

    /// Evaluate pending changes now, publishing an update if anything changed
    /// (or unconditionally with `force`).
    pub fn update(&mut self, force: bool, now_ms: u64) {
        if let Some(update) = self.membership.evaluate(force) {
            self.publish(update, now_ms);
        }
    }

    /// Change one of our caller attributes. Peers see it on their next round.
    pub fn set_attribute(
        &mut self,
        key: &str,
        value: Value,
        now_ms: u64,
    ) -> Result<bool, MemberError> {
        self.membership.set_attribute(key, value, now_ms)
    }

    // ========== Bus ==========

    /// Handle one raw delivery from the bus.
    pub fn handle_message(&mut self, data: &[u8], now_ms: u64) {
        match Inbound::from_json(data) {
            Ok(inbound) => self.handle_inbound(inbound, now_ms),
            Err(e) => warn!("Dropping undecodable bus message ({} bytes): {}", data.len(), e),
        }
    }

    /// Handle one parsed delivery from the bus.
    pub fn handle_inbound(&mut self, inbound: Inbound, now_ms: u64) {
        if !self.running {
            return;
        }
        match inbound {
            Inbound::Protocol(BusMessage::Ping { id }) => {
                trace!("Ping from {}", id);
                let pong = self.membership.pong();
                self.send(&pong);
            }
            Inbound::Protocol(BusMessage::Pong { id, attributes }) => {
                self.membership.receive_pong(id, attributes);
            }
            Inbound::Protocol(message @ BusMessage::Elect { .. }) => {
                let id = message.id();
                debug!("Elect message names {}", id);
                match message.to_value() {
                    Ok(value) => self.emit_message(value),
                    Err(e) => warn!("Could not forward elect message: {}", e),
                }
                let forced = self.election.on_elect(id, &mut election_env!(self, now_ms));
                if let Some(update) = forced {
                    self.publish(update, now_ms);
                }
            }
            Inbound::Other(value) => self.emit_message(value),
        }
    }

    /// Post an application message to every other context on the channel.
    pub fn broadcast(&self, value: &Value) -> Result<(), crate::BusError> {
        let data = serde_json::to_vec(value)?;
        self.bus.send(&data)
    }

    // ========== Internals ==========

    fn run_round(&mut self, now_ms: u64) {
        let round = self.membership.begin_round();
        if let Some(update) = round.update {
            self.publish(update, now_ms);
        }
        self.send(&round.ping);
        // An announcement made while publishing asks for an immediate round;
        // one has just begun, so the regular interval takes that slot.
        self.scheduler
            .schedule(TimerKind::Heartbeat, self.config.heartbeat_interval);
    }

    /// Deliver an update to subscribers, then to the election. A forced update
    /// produced by the election is delivered the same way afterwards.
    fn publish(&mut self, update: MembershipUpdate, now_ms: u64) {
        let mut pending = VecDeque::from([update]);
        while let Some(update) = pending.pop_front() {
            let event = PresenceEvent::Update(update);
            self.events.emit(&event);
            let PresenceEvent::Update(update) = event else {
                continue;
            };
            if let Some(next) = self.election.on_update(&update, &mut election_env!(self, now_ms)) {
                pending.push_back(next);
            }
        }
    }

    fn emit_message(&self, value: Value) {
        self.events.emit(&PresenceEvent::Message(value));
    }

    fn send(&self, message: &BusMessage) {
        match message.to_json() {
            Ok(data) => {
                if let Err(e) = self.bus.send(&data) {
                    warn!("Failed to send {}: {}", message.action(), e);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", message.action(), e),
        }
    }
}
