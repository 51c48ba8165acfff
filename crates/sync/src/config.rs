//! Synchronization configuration with sensible defaults.
//!
//! All magic numbers live here as named constants.

use tokio::time;

use spacesync_sync_primitives::StorageType;

/// Default maximum number of spaces hot sync keeps awake at once
pub const DEFAULT_HOT_SYNC_MAX_ACTIVE: usize = 300;

/// Default idle time after which an awake space is put back to sleep (20 seconds)
pub const DEFAULT_HOT_SYNC_IDLE_THRESHOLD_SECS: u64 = 20;

/// Default hot sync tick period (5 seconds)
pub const DEFAULT_HOT_SYNC_TICK_SECS: u64 = 5;

/// Default size of one compressed cold sync chunk (1 MiB)
pub const DEFAULT_COLD_SYNC_CHUNK_SIZE: usize = 1024 * 1024;

/// Default deadline for a whole cold sync transfer (10 minutes)
pub const DEFAULT_COLD_SYNC_TIMEOUT_SECS: u64 = 10 * 60;

/// Default wait for a single reconciliation response (30 seconds)
pub const DEFAULT_RECONCILIATION_RECV_TIMEOUT_SECS: u64 = 30;

/// Default number of key bits addressing head index buckets (256 buckets)
pub const DEFAULT_HEAD_INDEX_BUCKET_BITS: u8 = 8;

/// Default idle time before an unreferenced storage container is closed (60 seconds)
pub const DEFAULT_CONTAINER_TTL_SECS: u64 = 60;

/// Default period of the idle container reaper (30 seconds)
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;

#[derive(Copy, Clone, Debug)]
pub struct HotSyncConfig {
    /// Capacity of the active set
    pub max_active: usize,

    /// Idle time after which an active space is evicted
    pub idle_threshold: time::Duration,

    /// Period between ticks
    pub tick_interval: time::Duration,
}

impl Default for HotSyncConfig {
    fn default() -> Self {
        Self {
            max_active: DEFAULT_HOT_SYNC_MAX_ACTIVE,
            idle_threshold: time::Duration::from_secs(DEFAULT_HOT_SYNC_IDLE_THRESHOLD_SECS),
            tick_interval: time::Duration::from_secs(DEFAULT_HOT_SYNC_TICK_SECS),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ColdSyncConfig {
    /// Compressed bytes buffered before a chunk is flushed to the wire
    pub chunk_size: usize,

    /// Deadline for a whole transfer
    pub timeout: time::Duration,

    /// Storage-protocol tag this node declares
    pub storage_type: StorageType,
}

impl Default for ColdSyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_COLD_SYNC_CHUNK_SIZE,
            timeout: time::Duration::from_secs(DEFAULT_COLD_SYNC_TIMEOUT_SECS),
            storage_type: StorageType::default(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ReconciliationConfig {
    /// Wait for a single response frame
    pub recv_timeout: time::Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            recv_timeout: time::Duration::from_secs(DEFAULT_RECONCILIATION_RECV_TIMEOUT_SECS),
        }
    }
}

/// Synchronization configuration.
///
/// Controls timing, capacity, and protocol behavior of every sync component.
#[derive(Copy, Clone, Debug)]
pub struct SyncConfig {
    pub hot_sync: HotSyncConfig,

    pub cold_sync: ColdSyncConfig,

    pub reconciliation: ReconciliationConfig,

    /// Key bits addressing head index buckets
    pub head_index_bucket_bits: u8,

    /// Idle time before an unreferenced storage container is closed
    pub container_ttl: time::Duration,

    /// Period of the idle container reaper
    pub reap_interval: time::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hot_sync: HotSyncConfig::default(),
            cold_sync: ColdSyncConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            head_index_bucket_bits: DEFAULT_HEAD_INDEX_BUCKET_BITS,
            container_ttl: time::Duration::from_secs(DEFAULT_CONTAINER_TTL_SECS),
            reap_interval: time::Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
        }
    }
}
