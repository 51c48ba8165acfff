//! Anti-entropy synchronization between space replicas.
//!
//! - [`head_index`] keeps one range-diff of space heads per partition.
//! - [`reconciliation`] answers and issues range queries against it.
//! - [`coldsync`] bulk-copies a whole space from a peer that has it.
//! - [`hotsync`] keeps recently changed spaces loaded, within a budget.
//!
//! [`SyncServer`] routes inbound streams to the right responder and
//! [`SyncService`] wires everything to a [`Store`](spacesync_store::Store).

pub mod coldsync;
pub mod config;
pub mod head_index;
pub mod hotsync;
pub mod reconciliation;
pub mod scheduler;
mod sequencer;
pub mod server;
pub mod service;

pub use coldsync::{ColdSync, ColdSyncError, ColdSyncResponder, TransferStats};
pub use config::{ColdSyncConfig, HotSyncConfig, ReconciliationConfig, SyncConfig};
pub use head_index::{HeadIndex, HeadIndexError, RangeDiff, WarmUpStats};
pub use hotsync::{HotSync, HotSyncStats, SpaceCache, TickOutcome};
pub use reconciliation::{Reconciliation, ReconciliationClient, SpaceDiffs};
pub use scheduler::PeriodicTask;
pub use server::SyncServer;
pub use service::SyncService;
