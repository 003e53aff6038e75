//! Drives one `PresenceContext` on a tokio task.
//!
//! The runner is the context's event loop: it selects over bus deliveries,
//! timer firings and commands, handing each to the context one at a time. It
//! also implements the `Scheduler` seam with spawned sleep tasks, and
//! publishes a status snapshot after every step for observers.

use crate::hub::LocalHub;
use anyhow::{Context, Result};
use presence_core::{
    Collaborators, ContextId, ContextOptions, IdentityStore, LockService, PresenceContext, Role,
    Scheduler, TimerKind,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A pending single-shot timer. Dropping the handle aborts it.
pub struct ScheduledTask {
    generation: u64,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A timer that went off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fired {
    kind: TimerKind,
    generation: u64,
}

/// Generation of the armed task per timer kind, shared with the run loop.
///
/// A task can fire just as it is being replaced; its firing then carries a
/// generation that is no longer armed and gets dropped.
type Armed = Arc<Mutex<HashMap<TimerKind, u64>>>;

/// `Scheduler` backed by tokio sleep tasks.
struct TokioScheduler {
    fired: mpsc::UnboundedSender<Fired>,
    armed: Armed,
    tasks: HashMap<TimerKind, ScheduledTask>,
    next_generation: u64,
}

impl TokioScheduler {
    fn new(fired: mpsc::UnboundedSender<Fired>, armed: Armed) -> Self {
        Self {
            fired,
            armed,
            tasks: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, timer: TimerKind, after: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = fired.send(Fired {
                kind: timer,
                generation,
            });
        });

        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(timer, generation);
        // Replacing the old task aborts it
        self.tasks
            .insert(timer, ScheduledTask { generation, handle });
        trace!("Armed {:?} #{} in {:?}", timer, generation, after);
    }

    fn cancel(&mut self, timer: TimerKind) {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&timer);
        if let Some(task) = self.tasks.remove(&timer) {
            trace!("Cancelled {:?} #{}", timer, task.generation());
        }
    }
}

/// Requests a host can make of a running context.
#[derive(Debug, Clone)]
pub enum Command {
    /// Change one caller attribute
    SetAttribute { key: String, value: Value },
    /// Post an application message to the other contexts
    Broadcast(Value),
    /// Rejoin after a stop
    Start,
    /// Stop heartbeating but keep the task alive
    Stop,
    /// Stop and end the task
    Shutdown,
}

/// Snapshot of a context published after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStatus {
    pub id: ContextId,
    pub running: bool,
    pub role: Role,
    /// Leader as of the last completed round (or us, if we lead)
    pub leader: Option<ContextId>,
    /// Members in the last completed round
    pub members: usize,
}

impl ContextStatus {
    fn of(context: &PresenceContext) -> Self {
        let previous = context.membership().previous();
        Self {
            id: context.id(),
            running: context.is_running(),
            role: context.role(),
            leader: context.observed_leader(),
            members: previous.map_or(context.table().len(), |table| table.len()),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

/// Everything needed to spawn a runner.
pub struct RunnerConfig {
    /// Name used in logs
    pub name: String,
    pub channel: String,
    pub options: ContextOptions,
    pub locks: Arc<dyn LockService>,
    pub identity: Arc<dyn IdentityStore>,
}

/// Spawns context runners onto the current tokio runtime.
pub struct ContextRunner;

impl ContextRunner {
    /// Build a context, join its channel on `hub` and start it on a new task.
    pub fn spawn(hub: &LocalHub, config: RunnerConfig) -> Result<RunnerHandle> {
        let (bus, inbox) = hub.join(&config.channel);
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let armed = Armed::default();
        let scheduler = TokioScheduler::new(fired_tx, Arc::clone(&armed));

        let context = PresenceContext::new(
            config.options,
            Collaborators {
                bus: Box::new(bus),
                locks: config.locks,
                identity: config.identity,
                scheduler: Box::new(scheduler),
            },
            presence_core::now_ms(),
        )
        .with_context(|| format!("Failed to create context '{}'", config.name))?;

        let id = context.id();
        let (status_tx, status_rx) = watch::channel(ContextStatus::of(&context));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let run_loop = RunLoop {
            name: config.name.clone(),
            context,
            inbox,
            fired: fired_rx,
            armed,
            commands: command_rx,
            status: status_tx,
        };
        let task = tokio::spawn(run_loop.run());
        info!("Spawned context '{}' as {}", config.name, id);

        Ok(RunnerHandle {
            name: config.name,
            id,
            commands: command_tx,
            status: status_rx,
            task,
        })
    }
}

struct RunLoop {
    name: String,
    context: PresenceContext,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    fired: mpsc::UnboundedReceiver<Fired>,
    armed: Armed,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ContextStatus>,
}

impl RunLoop {
    async fn run(mut self) {
        self.context.start(presence_core::now_ms());
        self.publish_status();

        loop {
            tokio::select! {
                Some(data) = self.inbox.recv() => {
                    self.context.handle_message(&data, presence_core::now_ms());
                }

                Some(fired) = self.fired.recv() => {
                    if self.disarm(fired) {
                        self.context.on_timer(fired.kind, presence_core::now_ms());
                    } else {
                        trace!("Dropping stale {:?} #{}", fired.kind, fired.generation);
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }
            }
            self.publish_status();
        }

        self.context.stop(presence_core::now_ms());
        self.publish_status();
        debug!("Context '{}' run loop finished", self.name);
    }

    /// Consume the armed slot for a firing. False if it was superseded.
    fn disarm(&self, fired: Fired) -> bool {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if armed.get(&fired.kind) == Some(&fired.generation) {
            armed.remove(&fired.kind);
            true
        } else {
            false
        }
    }

    fn on_command(&mut self, command: Command) {
        let now = presence_core::now_ms();
        match command {
            Command::SetAttribute { key, value } => {
                if let Err(e) = self.context.set_attribute(&key, value, now) {
                    warn!("Context '{}' rejected attribute: {}", self.name, e);
                }
            }
            Command::Broadcast(value) => {
                if let Err(e) = self.context.broadcast(&value) {
                    warn!("Context '{}' failed to broadcast: {}", self.name, e);
                }
            }
            Command::Start => self.context.start(now),
            Command::Stop => self.context.stop(now),
            Command::Shutdown => {}
        }
    }

    fn publish_status(&self) {
        let status = ContextStatus::of(&self.context);
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.is_leader() != status.is_leader() {
                info!(
                    "Context '{}' is {}",
                    self.name,
                    if status.is_leader() { "now leader" } else { "no longer leader" }
                );
            }
            *current = status;
            true
        });
    }
}

/// Control handle for a running context.
pub struct RunnerHandle {
    name: String,
    id: ContextId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ContextStatus>,
    task: JoinHandle<()>,
}

impl RunnerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Latest status snapshot.
    pub fn status(&self) -> ContextStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status changes.
    pub fn watch(&self) -> watch::Receiver<ContextStatus> {
        self.status.clone()
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Context '{}' is no longer running", self.name))
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.send(Command::SetAttribute {
            key: key.into(),
            value,
        })
    }

    pub fn broadcast(&self, value: Value) -> Result<()> {
        self.send(Command::Broadcast(value))
    }

    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Stop the context and wait for its task to finish.
    pub async fn shutdown(self) -> Result<()> {
        // The loop also ends when the command channel closes
        let _ = self.commands.send(Command::Shutdown);
        self.task
            .await
            .with_context(|| format!("Context '{}' task failed", self.name))
    }

    /// End the task abruptly, as if the process hosting the context died.
    /// Nothing is sent; peers notice on their next round.
    pub fn kill(self) {
        warn!("Killing context '{}'", self.name);
        self.task.abort();
    }
}
