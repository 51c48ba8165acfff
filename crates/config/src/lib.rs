use core::num::NonZeroU32;
use core::time::Duration;
use std::fs::{read_to_string, write};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use spacesync_primitives::HashPartitioner;
use spacesync_store::StoreConfig;
use spacesync_sync::{ColdSyncConfig, HotSyncConfig, ReconciliationConfig, SyncConfig};
use spacesync_sync_primitives::StorageType;

pub const CONFIG_FILE: &str = "config.toml";

/// Default number of partitions spaces are spread over
pub const DEFAULT_PARTITION_COUNT: u32 = 3000;

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    #[serde(default)]
    pub sync: SyncSection,

    pub datastore: DataStoreConfig,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    pub head_index_bucket_bits: u8,

    #[serde(rename = "container_ttl_ms", with = "serde_duration")]
    pub container_ttl: Duration,

    #[serde(rename = "reap_interval_ms", with = "serde_duration")]
    pub reap_interval: Duration,

    pub hot_sync: HotSyncSection,

    pub cold_sync: ColdSyncSection,

    pub reconciliation: ReconciliationSection,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HotSyncSection {
    pub max_active: usize,

    #[serde(rename = "idle_threshold_ms", with = "serde_duration")]
    pub idle_threshold: Duration,

    #[serde(rename = "tick_interval_ms", with = "serde_duration")]
    pub tick_interval: Duration,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ColdSyncSection {
    pub chunk_size: usize,

    #[serde(rename = "timeout_ms", with = "serde_duration")]
    pub timeout: Duration,

    pub storage_type: u16,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconciliationSection {
    #[serde(rename = "recv_timeout_ms", with = "serde_duration")]
    pub recv_timeout: Duration,
}

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct DataStoreConfig {
    pub path: Utf8PathBuf,

    #[serde(default = "default_partition_count")]
    pub partition_count: NonZeroU32,
}

fn default_partition_count() -> NonZeroU32 {
    NonZeroU32::new(DEFAULT_PARTITION_COUNT).unwrap_or(NonZeroU32::MIN)
}

impl DataStoreConfig {
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            partition_count: default_partition_count(),
        }
    }
}

impl ConfigFile {
    #[must_use]
    pub const fn new(sync: SyncSection, datastore: DataStoreConfig) -> Self {
        Self { sync, datastore }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        toml::from_str(&content).wrap_err_with(|| format!("invalid configuration in {path:?}"))
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }

    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        self.sync.into()
    }

    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.datastore.path.clone())
    }

    #[must_use]
    pub const fn partitioner(&self) -> HashPartitioner {
        HashPartitioner::new(self.datastore.partition_count)
    }

    /// Get the value for a specific config key
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<String> {
        let sync = &self.sync;

        match key {
            "sync.hot_sync.max_active" => Some(sync.hot_sync.max_active.to_string()),
            "sync.hot_sync.idle_threshold_ms" => Some(millis(sync.hot_sync.idle_threshold)),
            "sync.hot_sync.tick_interval_ms" => Some(millis(sync.hot_sync.tick_interval)),
            "sync.cold_sync.chunk_size" => Some(sync.cold_sync.chunk_size.to_string()),
            "sync.cold_sync.timeout_ms" => Some(millis(sync.cold_sync.timeout)),
            "sync.cold_sync.storage_type" => Some(sync.cold_sync.storage_type.to_string()),
            "sync.reconciliation.recv_timeout_ms" => Some(millis(sync.reconciliation.recv_timeout)),
            "sync.head_index_bucket_bits" => Some(sync.head_index_bucket_bits.to_string()),
            "sync.container_ttl_ms" => Some(millis(sync.container_ttl)),
            "sync.reap_interval_ms" => Some(millis(sync.reap_interval)),
            "datastore.path" => Some(self.datastore.path.to_string()),
            "datastore.partition_count" => Some(self.datastore.partition_count.to_string()),
            _ => None,
        }
    }
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

impl Default for SyncSection {
    fn default() -> Self {
        SyncConfig::default().into()
    }
}

impl Default for HotSyncSection {
    fn default() -> Self {
        HotSyncConfig::default().into()
    }
}

impl Default for ColdSyncSection {
    fn default() -> Self {
        ColdSyncConfig::default().into()
    }
}

impl Default for ReconciliationSection {
    fn default() -> Self {
        ReconciliationConfig::default().into()
    }
}

impl From<SyncConfig> for SyncSection {
    fn from(config: SyncConfig) -> Self {
        Self {
            hot_sync: config.hot_sync.into(),
            cold_sync: config.cold_sync.into(),
            reconciliation: config.reconciliation.into(),
            head_index_bucket_bits: config.head_index_bucket_bits,
            container_ttl: config.container_ttl,
            reap_interval: config.reap_interval,
        }
    }
}

impl From<SyncSection> for SyncConfig {
    fn from(section: SyncSection) -> Self {
        Self {
            hot_sync: section.hot_sync.into(),
            cold_sync: section.cold_sync.into(),
            reconciliation: section.reconciliation.into(),
            head_index_bucket_bits: section.head_index_bucket_bits,
            container_ttl: section.container_ttl,
            reap_interval: section.reap_interval,
        }
    }
}

impl From<HotSyncConfig> for HotSyncSection {
    fn from(config: HotSyncConfig) -> Self {
        Self {
            max_active: config.max_active,
            idle_threshold: config.idle_threshold,
            tick_interval: config.tick_interval,
        }
    }
}

impl From<HotSyncSection> for HotSyncConfig {
    fn from(section: HotSyncSection) -> Self {
        Self {
            max_active: section.max_active,
            idle_threshold: section.idle_threshold,
            tick_interval: section.tick_interval,
        }
    }
}

impl From<ColdSyncConfig> for ColdSyncSection {
    fn from(config: ColdSyncConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            timeout: config.timeout,
            storage_type: config.storage_type.get(),
        }
    }
}

impl From<ColdSyncSection> for ColdSyncConfig {
    fn from(section: ColdSyncSection) -> Self {
        Self {
            chunk_size: section.chunk_size,
            timeout: section.timeout,
            storage_type: StorageType::new(section.storage_type),
        }
    }
}

impl From<ReconciliationConfig> for ReconciliationSection {
    fn from(config: ReconciliationConfig) -> Self {
        Self {
            recv_timeout: config.recv_timeout,
        }
    }
}

impl From<ReconciliationSection> for ReconciliationConfig {
    fn from(section: ReconciliationSection) -> Self {
        Self {
            recv_timeout: section.recv_timeout,
        }
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
