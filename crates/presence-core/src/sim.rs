//! Deterministic virtual-time harness for driving several contexts together.
//!
//! Every context gets a bus and scheduler that record into shared queues
//! instead of doing I/O. `Simulation::run_for` then delivers messages and
//! fires timers in due-time order, one at a time, on a virtual millisecond
//! clock. Messages reach every other live context after a base latency plus
//! a seeded per-delivery jitter, so deliveries from one sender can overtake
//! each other and a pong can land in the receiver's next round. Individual
//! protocol messages can be dropped with `drop_next`.

use crate::context::{Collaborators, ContextOptions, PresenceContext};
use crate::schedule::{Scheduler, TimerKind};
use crate::{
    Bus, BusError, ContextId, Identity, Inbound, LocalLocks, MemoryIdentityStore, PresenceConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Outbox {
    messages: Vec<(usize, Vec<u8>)>,
    timers: Vec<(usize, TimerKind, Option<Duration>)>,
}

type SharedOutbox = Arc<Mutex<Outbox>>;

struct SimBus {
    node: usize,
    channel: String,
    outbox: SharedOutbox,
}

impl Bus for SimBus {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn send(&self, data: &[u8]) -> Result<(), BusError> {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages
            .push((self.node, data.to_vec()));
        Ok(())
    }
}

struct SimScheduler {
    node: usize,
    outbox: SharedOutbox,
}

impl SimScheduler {
    fn push(&self, timer: TimerKind, after: Option<Duration>) {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timers
            .push((self.node, timer, after));
    }
}

impl Scheduler for SimScheduler {
    fn schedule(&mut self, timer: TimerKind, after: Duration) {
        self.push(timer, Some(after));
    }

    fn cancel(&mut self, timer: TimerKind) {
        self.push(timer, None);
    }
}

#[derive(Debug)]
enum SimEvent {
    Deliver { to: usize, data: Vec<u8> },
    Timer { node: usize, kind: TimerKind, generation: u64 },
}

struct Node {
    store: MemoryIdentityStore,
    options: ContextOptions,
    context: Option<PresenceContext>,
}

/// A set of contexts on one channel sharing one lock table.
pub struct Simulation {
    now: u64,
    seq: u64,
    latency: u64,
    jitter: u64,
    rng: StdRng,
    /// Protocol actions whose next broadcast is lost
    drops: Vec<&'static str>,
    dropped: usize,
    channel: String,
    config: PresenceConfig,
    locks: LocalLocks,
    outbox: SharedOutbox,
    nodes: Vec<Node>,
    queue: BTreeMap<(u64, u64), SimEvent>,
    generations: HashMap<(usize, TimerKind), u64>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

impl Simulation {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            now: 0,
            seq: 0,
            latency: 1,
            jitter: 0,
            rng: StdRng::seed_from_u64(0),
            drops: Vec::new(),
            dropped: 0,
            channel: "sim".to_string(),
            config,
            locks: LocalLocks::new(),
            outbox: Arc::default(),
            nodes: Vec::new(),
            queue: BTreeMap::new(),
            generations: HashMap::new(),
        }
    }

    /// Set the one-way bus latency in ms.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency = latency_ms;
        self
    }

    /// Delay every delivery by up to `jitter_ms` on top of the base latency,
    /// drawn independently per recipient from a generator seeded with `seed`.
    pub fn with_jitter(mut self, jitter_ms: u64, seed: u64) -> Self {
        self.jitter = jitter_ms;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Lose the next broadcast carrying `action` (`"ping"`, `"pong"` or
    /// `"elect"`) before it reaches anyone.
    pub fn drop_next(&mut self, action: &'static str) {
        self.drops.push(action);
    }

    /// Number of broadcasts lost so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Virtual time in ms.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn locks(&self) -> &LocalLocks {
        &self.locks
    }

    /// Add a context with id `index + 1` created at `created`. Returns its index.
    pub fn add_context(&mut self, created: u64, eligible: bool) -> usize {
        let identity = Identity {
            id: ContextId::from(self.nodes.len() as u64 + 1),
            created,
        };
        let mut options = ContextOptions::new(self.config.clone());
        options.ineligible = !eligible;
        self.add_with(identity, options)
    }

    /// Add a context with an explicit identity and options. Returns its index.
    pub fn add_with(&mut self, identity: Identity, options: ContextOptions) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            store: MemoryIdentityStore::with_identity(identity),
            options,
            context: None,
        });
        self.build(index);
        index
    }

    fn build(&mut self, index: usize) {
        let node = &self.nodes[index];
        let collaborators = Collaborators {
            bus: Box::new(SimBus {
                node: index,
                channel: self.channel.clone(),
                outbox: Arc::clone(&self.outbox),
            }),
            locks: Arc::new(self.locks.clone()),
            identity: Arc::new(node.store.clone()),
            scheduler: Box::new(SimScheduler {
                node: index,
                outbox: Arc::clone(&self.outbox),
            }),
        };
        let context = PresenceContext::new(node.options.clone(), collaborators, self.now)
            .unwrap_or_else(|e| panic!("memory identity store failed: {}", e));
        self.nodes[index].context = Some(context);
    }

    /// Start context `index` at the current virtual time.
    pub fn start(&mut self, index: usize) {
        let now = self.now;
        self.context_mut(index).start(now);
        self.pump();
    }

    /// Stop context `index` gracefully.
    pub fn stop(&mut self, index: usize) {
        let now = self.now;
        self.context_mut(index).stop(now);
        self.pump();
    }

    /// Drop context `index` without any goodbye. Its held locks are released
    /// and its pending timers and deliveries go nowhere.
    pub fn crash(&mut self, index: usize) {
        self.nodes[index].context = None;
    }

    /// Replace context `index` with a fresh one built on the same identity
    /// store, as a page reload would, and start it.
    pub fn reload(&mut self, index: usize) {
        self.crash(index);
        self.build(index);
        self.start(index);
    }

    pub fn is_alive(&self, index: usize) -> bool {
        self.nodes[index].context.is_some()
    }

    /// Context `index`. Panics if it crashed.
    pub fn context(&self, index: usize) -> &PresenceContext {
        self.nodes[index]
            .context
            .as_ref()
            .unwrap_or_else(|| panic!("context {} is not alive", index))
    }

    /// Mutable context `index`. Panics if it crashed. Call `pump` after
    /// anything that may send or schedule.
    pub fn context_mut(&mut self, index: usize) -> &mut PresenceContext {
        self.nodes[index]
            .context
            .as_mut()
            .unwrap_or_else(|| panic!("context {} is not alive", index))
    }

    pub fn identity_store(&self, index: usize) -> &MemoryIdentityStore {
        &self.nodes[index].store
    }

    /// Who context `index` believes leads.
    pub fn observed_leader(&self, index: usize) -> Option<ContextId> {
        self.context(index).observed_leader()
    }

    /// Ids of live contexts that currently consider themselves leader.
    pub fn leaders(&self) -> Vec<ContextId> {
        self.live().filter(|c| c.is_leader()).map(|c| c.id()).collect()
    }

    fn live(&self) -> impl Iterator<Item = &PresenceContext> {
        self.nodes.iter().filter_map(|n| n.context.as_ref())
    }

    /// Advance virtual time by `ms`, processing everything due on the way.
    pub fn run_for(&mut self, ms: u64) {
        let until = self.now + ms;
        loop {
            self.pump();
            let Some(entry) = self.queue.first_entry() else {
                break;
            };
            let (due, _) = *entry.key();
            if due > until {
                break;
            }
            let event = entry.remove();
            self.now = due;
            self.dispatch(event);
        }
        self.now = until;
    }

    /// Move everything contexts sent or scheduled into the event queue.
    pub fn pump(&mut self) {
        let outbox = std::mem::take(&mut *self.outbox.lock().unwrap_or_else(|e| e.into_inner()));

        for (from, data) in outbox.messages {
            if self.should_drop(&data) {
                continue;
            }
            for to in 0..self.nodes.len() {
                if to != from && self.nodes[to].context.is_some() {
                    let due = self.now + self.latency + self.rng.random_range(0..=self.jitter);
                    self.enqueue(due, SimEvent::Deliver { to, data: data.clone() });
                }
            }
        }

        for (node, kind, after) in outbox.timers {
            let generation = self.generations.entry((node, kind)).or_insert(0);
            *generation += 1;
            let generation = *generation;
            if let Some(after) = after {
                let due = self.now + after.as_millis() as u64;
                self.enqueue(due, SimEvent::Timer { node, kind, generation });
            }
        }
    }

    fn should_drop(&mut self, data: &[u8]) -> bool {
        if self.drops.is_empty() {
            return false;
        }
        let Ok(Inbound::Protocol(message)) = Inbound::from_json(data) else {
            return false;
        };
        let Some(pos) = self.drops.iter().position(|a| *a == message.action()) else {
            return false;
        };
        self.drops.remove(pos);
        self.dropped += 1;
        true
    }

    fn enqueue(&mut self, due: u64, event: SimEvent) {
        self.seq += 1;
        self.queue.insert((due, self.seq), event);
    }

    fn dispatch(&mut self, event: SimEvent) {
        let now = self.now;
        match event {
            SimEvent::Deliver { to, data } => {
                if let Some(context) = self.nodes[to].context.as_mut() {
                    context.handle_message(&data, now);
                }
            }
            SimEvent::Timer { node, kind, generation } => {
                if self.generations.get(&(node, kind)) != Some(&generation) {
                    return;
                }
                if let Some(context) = self.nodes[node].context.as_mut() {
                    context.on_timer(kind, now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, IdentityStore, PresenceEvent, Role};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(n: u64) -> ContextId {
        ContextId::from(n)
    }

    /// A(0), B(50), C(100) joining 50ms apart.
    fn three_contexts() -> Simulation {
        three_contexts_on(Simulation::default())
    }

    fn three_contexts_on(mut sim: Simulation) -> Simulation {
        let a = sim.add_context(0, true);
        let b = sim.add_context(50, true);
        let c = sim.add_context(100, true);
        sim.start(a);
        sim.run_for(50);
        sim.start(b);
        sim.run_for(50);
        sim.start(c);
        sim
    }

    // ==================== Election ====================

    #[test]
    fn test_single_context_elects_itself() {
        let mut sim = Simulation::default();
        let a = sim.add_context(10, true);
        sim.start(a);
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(1)]);
        assert_eq!(sim.context(a).role(), Role::Leader);
        assert_eq!(sim.context(a).last_known_leader(), Some(id(1)));
    }

    #[test]
    fn test_oldest_of_three_wins() {
        let mut sim = three_contexts();
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(1)]);
        for index in 0..3 {
            assert_eq!(sim.observed_leader(index), Some(id(1)));
        }
        assert_eq!(sim.context(1).role(), Role::Candidate);
    }

    #[test]
    fn test_start_order_does_not_matter() {
        let mut sim = Simulation::default();
        let young = sim.add_context(500, true);
        let old = sim.add_context(100, true);
        sim.start(young);
        sim.start(old);
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![sim.context(old).id()]);
    }

    #[test]
    fn test_ineligible_oldest_is_skipped() {
        let mut sim = Simulation::default();
        let a = sim.add_context(0, false);
        let b = sim.add_context(50, true);
        let c = sim.add_context(100, true);
        for index in [a, b, c] {
            sim.start(index);
        }
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(2)]);
        assert_eq!(sim.context(a).role(), Role::Ineligible);
        assert_eq!(sim.observed_leader(a), Some(id(2)));
    }

    #[test]
    fn test_only_ineligible_members_elect_nobody() {
        let mut sim = Simulation::default();
        let a = sim.add_context(0, false);
        let b = sim.add_context(50, false);
        sim.start(a);
        sim.start(b);
        sim.run_for(1000);

        assert!(sim.leaders().is_empty());
        assert!(!sim.context(a).election_in_progress());
    }

    #[test]
    fn test_equal_creation_times_break_tie_by_id() {
        let mut sim = Simulation::default();
        let a = sim.add_context(42, true);
        let b = sim.add_context(42, true);
        sim.start(b);
        sim.start(a);
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(1)]);
    }

    #[test]
    fn test_leader_is_stable_across_rounds() {
        let mut sim = three_contexts();
        sim.run_for(1000);
        let won = sim.context(0).membership().rounds();
        sim.run_for(2000);

        assert_eq!(sim.leaders(), vec![id(1)]);
        assert!(sim.context(0).membership().rounds() > won);
        assert!(!sim.locks().is_held("election"));
        assert!(!sim.locks().is_held("assert-leader"));
    }

    #[test]
    fn test_older_joiner_takes_over() {
        let mut sim = Simulation::default();
        let young = sim.add_context(500, true);
        sim.start(young);
        sim.run_for(1000);
        assert_eq!(sim.leaders(), vec![id(1)]);

        // A joiner sees only itself on its first round and runs an election
        let old = sim.add_context(100, true);
        sim.start(old);
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(2)]);
        assert_eq!(sim.context(young).role(), Role::Candidate);
        assert_eq!(sim.identity_store(young).last_known_leader(), Some(id(2)));
    }

    // ==================== Failover ====================

    #[test]
    fn test_crashed_leader_is_replaced() {
        let mut sim = three_contexts();
        sim.run_for(1000);
        assert_eq!(sim.leaders(), vec![id(1)]);

        sim.crash(0);
        let heartbeat = 100;
        let decision = 200;
        // One round to notice, one round to trigger, the decision, and slack
        sim.run_for(2 * heartbeat + decision + 50);

        assert_eq!(sim.leaders(), vec![id(2)]);
        assert_eq!(sim.observed_leader(2), Some(id(2)));
        assert_eq!(sim.identity_store(1).last_known_leader(), Some(id(2)));
    }

    #[test]
    fn test_stopped_leader_is_replaced() {
        let mut sim = three_contexts();
        sim.run_for(1000);

        sim.stop(0);
        assert!(!sim.context(0).is_leader());
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(2)]);
        assert!(!sim.context(1).table().contains_key(&id(1)));
    }

    #[test]
    fn test_crash_during_election_releases_lock() {
        let mut sim = Simulation::default();
        let a = sim.add_context(0, true);
        let b = sim.add_context(50, true);
        sim.start(a);
        sim.start(b);
        sim.run_for(10);
        assert!(sim.locks().is_held("election"));

        sim.crash(a);
        assert!(!sim.locks().is_held("election"));
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(2)]);
    }

    #[test]
    fn test_restarted_context_rejoins() {
        let mut sim = three_contexts();
        sim.run_for(1000);
        sim.stop(2);
        sim.run_for(500);
        assert!(!sim.context(0).table().contains_key(&id(3)));

        sim.start(2);
        sim.run_for(500);
        let previous = sim.context(0).membership().previous().unwrap();
        assert!(previous.contains_key(&id(3)));
        assert_eq!(sim.leaders(), vec![id(1)]);
    }

    // ==================== Delivery ====================

    #[test]
    fn test_oldest_wins_with_late_pongs() {
        // Round trips above one heartbeat push pongs into the next round
        for latency in [10, 30, 49, 60, 99, 150] {
            let mut sim = three_contexts_on(Simulation::default().with_latency(latency));
            sim.run_for(3000);

            assert_eq!(sim.leaders(), vec![id(1)], "latency {}ms", latency);
        }
    }

    #[test]
    fn test_crashed_leader_is_replaced_with_late_pongs() {
        for latency in [30, 60] {
            let mut sim = three_contexts_on(Simulation::default().with_latency(latency));
            sim.run_for(2000);
            assert_eq!(sim.leaders(), vec![id(1)], "latency {}ms", latency);

            sim.crash(0);
            sim.run_for(3000);

            assert_eq!(sim.leaders(), vec![id(2)], "latency {}ms", latency);
        }
    }

    #[test]
    fn test_reordered_delivery_converges_on_oldest() {
        for seed in 0..8 {
            let sim = Simulation::default().with_latency(1).with_jitter(40, seed);
            let mut sim = three_contexts_on(sim);
            sim.run_for(3000);

            assert_eq!(sim.leaders(), vec![id(1)], "seed {}", seed);
            for index in 0..3 {
                assert_eq!(sim.observed_leader(index), Some(id(1)), "seed {}", seed);
            }
        }
    }

    #[test]
    fn test_failover_with_reordered_delivery() {
        for seed in 0..4 {
            let sim = Simulation::default().with_latency(1).with_jitter(40, seed);
            let mut sim = three_contexts_on(sim);
            sim.run_for(2000);

            sim.crash(0);
            sim.run_for(3000);

            assert_eq!(sim.leaders(), vec![id(2)], "seed {}", seed);
            assert_eq!(sim.observed_leader(2), Some(id(2)), "seed {}", seed);
        }
    }

    #[test]
    fn test_lost_elect_is_recovered() {
        let mut sim = Simulation::default();
        let young = sim.add_context(500, true);
        let old = sim.add_context(100, true);
        sim.drop_next("elect");
        // The younger context runs the first election and names the older one
        sim.start(young);
        sim.start(old);
        sim.run_for(300);
        assert_eq!(sim.dropped(), 1);

        sim.run_for(1000);
        assert_eq!(sim.leaders(), vec![sim.context(old).id()]);
        assert_eq!(sim.observed_leader(young), Some(sim.context(old).id()));
    }

    #[test]
    fn test_lost_pong_does_not_unseat_leader() {
        let mut sim = three_contexts();
        sim.run_for(1000);

        sim.drop_next("pong");
        sim.run_for(1000);

        assert_eq!(sim.dropped(), 1);
        assert_eq!(sim.leaders(), vec![id(1)]);
    }

    // ==================== Identity ====================

    #[test]
    fn test_reload_keeps_identity() {
        let mut sim = three_contexts();
        sim.run_for(1000);
        let before = sim.context(1).identity();

        sim.reload(1);
        assert_eq!(sim.context(1).identity(), before);
        assert_eq!(sim.context(1).membership().local().updated, sim.now());
        assert_eq!(sim.context(1).last_known_leader(), Some(id(1)));
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(1)]);
    }

    #[test]
    fn test_reloaded_leader_keeps_seniority() {
        let mut sim = three_contexts();
        sim.run_for(1000);

        sim.reload(0);
        sim.run_for(1000);

        assert_eq!(sim.leaders(), vec![id(1)]);
    }

    // ==================== Presence ====================

    #[test]
    fn test_first_update_contains_self() {
        let mut sim = Simulation::default();
        let a = sim.add_context(0, true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = sim.context(a).on(EventKind::Update, move |event| {
            if let PresenceEvent::Update(update) = event {
                sink.lock().unwrap().push(update.clone());
            }
        });

        sim.start(a);
        let seen = seen.lock().unwrap();
        let first = seen.first().expect("update on start");
        assert!(first.dirty.contains(&id(1)));
        assert!(first.table[&id(1)].me);
    }

    #[test]
    fn test_every_table_contains_self() {
        let mut sim = three_contexts();
        let violations = Arc::new(AtomicUsize::new(0));
        let mut subs = Vec::new();
        for index in 0..3 {
            let own = sim.context(index).id();
            let violations = Arc::clone(&violations);
            subs.push(sim.context(index).on(EventKind::Update, move |event| {
                if let PresenceEvent::Update(update) = event {
                    if !update.table.get(&own).is_some_and(|r| r.me) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        sim.run_for(1000);
        sim.crash(0);
        sim.run_for(1000);

        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_members_see_each_other() {
        let mut sim = three_contexts();
        sim.run_for(1000);
        // Mid-round the table may be partial; the completed round is full
        for index in 0..3 {
            let previous = sim.context(index).membership().previous().unwrap();
            assert_eq!(previous.len(), 3);
        }
    }

    #[test]
    fn test_attribute_change_reaches_peers() {
        let mut sim = three_contexts();
        sim.run_for(1000);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _sub = sim.context(0).on(EventKind::Update, move |event| {
            if let PresenceEvent::Update(update) = event {
                sink.lock().unwrap().push(update.dirty.clone());
            }
        });

        let now = sim.now();
        sim.context_mut(2)
            .set_attribute("title", json!("Inbox"), now)
            .unwrap();
        sim.run_for(300);

        assert!(changes.lock().unwrap().iter().any(|dirty| dirty.contains(&id(3))));
        let previous = sim.context(0).membership().previous().unwrap();
        assert_eq!(previous[&id(3)].attributes["title"], json!("Inbox"));
    }

    #[test]
    fn test_quiet_rounds_publish_nothing() {
        let mut sim = three_contexts();
        sim.run_for(1500);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _sub = sim.context(1).on(EventKind::Update, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sim.run_for(1000);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    // ==================== Events ====================

    #[test]
    fn test_application_messages_pass_through() {
        let mut sim = three_contexts();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _sub = sim.context(1).on(EventKind::Message, move |event| {
            if let PresenceEvent::Message(value) = event {
                sink.lock().unwrap().push(value.clone());
            }
        });

        sim.context(0)
            .broadcast(&json!({"action": "note-saved", "path": "a.md"}))
            .unwrap();
        sim.run_for(5);

        let received = received.lock().unwrap();
        assert!(received.contains(&json!({"action": "note-saved", "path": "a.md"})));
    }

    #[test]
    fn test_elect_is_visible_as_message() {
        let mut sim = three_contexts();
        let elects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&elects);
        let _sub = sim.context(2).on(EventKind::Message, move |event| {
            if let PresenceEvent::Message(value) = event {
                if value["action"] == "elect" {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        sim.run_for(1000);

        assert!(elects.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_faulty_subscriber_does_not_break_protocol() {
        let mut sim = three_contexts();
        let _bad = sim.context(0).on(EventKind::Update, |_| panic!("subscriber bug"));
        let good = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&good);
        let _good = sim.context(0).on(EventKind::Update, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sim.run_for(1000);

        assert!(good.load(Ordering::SeqCst) > 0);
        assert_eq!(sim.leaders(), vec![id(1)]);
    }

    #[test]
    fn test_unknown_event_name_registers_nothing() {
        let sim = three_contexts();
        assert!(sim.context(0).on_named("bogus", |_| {}).is_err());
        assert!(sim.context(0).on_named("update", |_| {}).is_ok());
    }

    #[test]
    fn test_undecodable_message_is_ignored() {
        let mut sim = three_contexts();
        let now = sim.now();
        sim.context_mut(0).handle_message(b"not json", now);
        sim.run_for(1000);
        assert_eq!(sim.leaders(), vec![id(1)]);
    }

    #[test]
    fn test_elect_naming_ineligible_is_ignored() {
        let mut sim = Simulation::default();
        let a = sim.add_context(0, false);
        sim.start(a);

        let now = sim.now();
        let elect = crate::BusMessage::elect(id(1)).to_json().unwrap();
        sim.context_mut(a).handle_message(&elect, now);

        assert!(!sim.context(a).is_leader());
    }

    #[test]
    fn test_stopped_context_ignores_bus() {
        let mut sim = Simulation::default();
        let a = sim.add_context(0, true);

        let elect = crate::BusMessage::elect(id(1)).to_json().unwrap();
        sim.context_mut(a).handle_message(&elect, 0);

        assert!(!sim.context(a).is_running());
        assert!(!sim.context(a).is_leader());
    }
}
