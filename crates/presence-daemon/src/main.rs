//! presence-daemon: Runs a group of presence contexts on one channel.
//!
//! Demonstrates heartbeat membership and leader election outside a browser:
//! every context runs on its own task, they talk over an in-process hub and
//! serialize elections through lock files.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use presence_core::{ContextId, ContextOptions, IdentityStore, MemoryIdentityStore, PresenceConfig};
use presence_daemon::{
    ContextRunner, ContextStatus, FileIdentityStore, FileLocks, LocalHub, RunnerConfig,
    RunnerHandle,
};

#[derive(Parser, Debug)]
#[command(name = "presence-daemon")]
#[command(about = "Heartbeat presence and leader election demo")]
struct Args {
    /// Channel the contexts share
    #[arg(long, default_value = "presence", env = "PRESENCE_CHANNEL")]
    channel: String,

    /// Number of contexts to run
    #[arg(short = 'n', long, default_value_t = 3, env = "PRESENCE_CONTEXTS")]
    contexts: usize,

    /// Directory for lock files (defaults to a directory under the system temp dir)
    #[arg(long, env = "PRESENCE_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    /// Directory for identity files; identities are kept in memory if unset
    #[arg(long, env = "PRESENCE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Indexes of contexts that may never lead (comma separated)
    #[arg(long, value_delimiter = ',')]
    ineligible: Vec<usize>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 100)]
    heartbeat_ms: u64,

    /// Election decision delay in milliseconds
    #[arg(long, default_value_t = 200)]
    election_delay_ms: u64,

    /// Stop whichever context leads after this many seconds, to show failover
    #[arg(long)]
    stop_leader_after_secs: Option<u64>,

    /// Exit after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            election_delay: Duration::from_millis(self.election_delay_ms),
            ..PresenceConfig::default()
        }
    }
}

/// Spawn every context, staggering their starts by one heartbeat so their
/// creation times differ.
async fn spawn_contexts(
    args: &Args,
    hub: &LocalHub,
    locks: Arc<FileLocks>,
) -> Result<Vec<RunnerHandle>> {
    let config = args.presence_config();
    let mut runners = Vec::with_capacity(args.contexts);

    for index in 0..args.contexts {
        let name = format!("context-{}", index);
        let identity: Arc<dyn IdentityStore> = match &args.state_dir {
            Some(dir) => Arc::new(FileIdentityStore::new(dir, &name)),
            None => Arc::new(MemoryIdentityStore::new()),
        };

        let mut options = ContextOptions::new(config.clone())
            .attribute("name", serde_json::Value::String(name.clone()));
        if args.ineligible.contains(&index) {
            options = options.ineligible();
        }

        let runner = ContextRunner::spawn(
            hub,
            RunnerConfig {
                name,
                channel: args.channel.clone(),
                options,
                locks: locks.clone(),
                identity,
            },
        )?;
        runners.push(runner);
        tokio::time::sleep(config.heartbeat_interval).await;
    }

    Ok(runners)
}

/// Forward every status change to one channel so the main loop can log them.
fn watch_statuses(runners: &[RunnerHandle]) -> mpsc::UnboundedReceiver<(String, ContextStatus)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for runner in runners {
        let mut status = runner.watch();
        let name = runner.name().to_string();
        let tx = tx.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let snapshot = status.borrow_and_update().clone();
                if tx.send((name.clone(), snapshot)).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

fn current_leader(runners: &[RunnerHandle]) -> Option<&RunnerHandle> {
    runners.iter().find(|r| r.status().is_leader())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,presence_daemon=debug,presence_core=debug"
    } else {
        "info,presence_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting presence-daemon");
    info!("Channel: {}, contexts: {}", args.channel, args.contexts);

    let lock_dir = args
        .lock_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("presence-locks").join(&args.channel));
    let locks = Arc::new(FileLocks::new(&lock_dir).context("Failed to set up lock directory")?);
    info!("Lock directory: {:?}", locks.dir());
    if let Some(dir) = &args.state_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {:?}", dir))?;
        info!("State directory: {:?}", dir);
    }

    let hub = LocalHub::new();
    let runners = spawn_contexts(&args, &hub, locks).await?;
    let mut statuses = watch_statuses(&runners);

    let stop_leader = async {
        match args.stop_leader_after_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_leader);
    let mut leader_stopped = false;

    let run_for = async {
        match args.run_for_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(run_for);

    let mut last_leader: Option<ContextId> = None;
    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some((name, status)) = statuses.recv() => {
                debug!("{}: {:?}", name, status);
                if status.is_leader() && last_leader != Some(status.id) {
                    info!("Leader is now {} ({}), {} member(s)", status.id, name, status.members);
                    last_leader = Some(status.id);
                }
            }

            _ = &mut stop_leader, if !leader_stopped => {
                leader_stopped = true;
                match current_leader(&runners) {
                    Some(leader) => {
                        info!(
                            "Stopping leader {} ({}) to demonstrate failover",
                            leader.id(),
                            leader.name()
                        );
                        leader.stop()?;
                    }
                    None => warn!("No leader to stop yet"),
                }
            }

            _ = &mut run_for => {
                info!("Run time elapsed");
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    for runner in runners {
        runner.shutdown().await?;
    }
    Ok(())
}
