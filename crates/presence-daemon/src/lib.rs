//! presence-daemon library: Exposes the host components for testing.
//!
//! A thin layer over `presence-core` that runs contexts on tokio with an
//! in-process bus, lock files and identity files.

pub mod hub;
pub mod identity;
pub mod locks;
pub mod runner;

// Re-export key types for convenience
pub use hub::{HubHandle, LocalHub};
pub use identity::{FileIdentityStore, PersistedIdentity};
pub use locks::FileLocks;
pub use runner::{Command, ContextRunner, ContextStatus, RunnerConfig, RunnerHandle, ScheduledTask};
