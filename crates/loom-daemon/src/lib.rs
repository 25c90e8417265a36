//! Orchestration engine for the loom machine daemon.

pub mod branch_watch;
pub mod capabilities;
pub mod command_session;
pub mod config;
pub mod daemon;
pub mod dedup;
pub mod diff;
pub mod dispatch;
pub mod git;
pub mod permission;
pub mod plan_review;
pub mod pty;
pub mod relay;
pub mod session;
pub mod terminal;
pub mod transport;
pub mod worktree;

#[cfg(test)]
mod testing;

pub use config::DaemonConfig;
pub use daemon::{Collaborators, Daemon};
