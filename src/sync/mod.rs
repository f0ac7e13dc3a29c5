// ABOUTME: Sync orchestration: change tracking, counter state, and the scheduled daemon
// ABOUTME: Ties the ERP extractor to the remote replication client

pub mod daemon;
pub mod state;
pub mod tracker;

pub use daemon::{CycleKind, DaemonConfig, SyncDaemon, SyncMode, SyncStats};
pub use state::{AlterCounters, SyncState};
pub use tracker::{ChangeSet, ChangeTracker, ColdReason, Decision};
