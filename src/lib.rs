//! snippet-reloader
//!
//! Watches a directory of externally written proxy configuration snippets,
//! validates the proxy configuration when the snippet set changes and reloads
//! the proxy only when validation succeeds.

pub mod command;
pub mod config;
pub mod metrics;
pub mod shutdown;
pub mod snapshot;
pub mod supervisor;
pub mod trigger;

pub use config::Config;
pub use shutdown::ShutdownCoordinator;
pub use snapshot::{Snapshot, SnapshotDiff};
pub use supervisor::{CycleOutcome, Supervisor, WatchState};

/// Common error type for the reloader
pub type Result<T> = anyhow::Result<T>;
