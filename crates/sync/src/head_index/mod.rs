//! Per-partition index of space heads.
//!
//! Each partition owns one [`RangeDiff`] over the `{space id, head}` pairs of
//! the spaces mapped into it. The partition map is locked only to find or
//! create a structure; reads and writes then go through that structure's own
//! lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use spacesync_primitives::{Hash, PartitionId, Partitioner, SpaceId};
use spacesync_store::{Store, StoreError, WriteHashObserver};
use spacesync_sync_primitives::{Range, RangeResult};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};

mod range_diff;

pub use range_diff::{key_of, RangeDiff, MAX_BUCKET_BITS};

#[derive(Debug, Error)]
pub enum HeadIndexError {
    #[error("space {0} is not in the head index")]
    NotFound(SpaceId),
}

/// Outcome of [`HeadIndex::warm_up`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WarmUpStats {
    pub loaded: usize,
    pub failed: usize,
}

pub struct HeadIndex {
    partitioner: Arc<dyn Partitioner>,
    bucket_bits: u8,
    partitions: Mutex<HashMap<PartitionId, Arc<RwLock<RangeDiff>>>>,
}

impl HeadIndex {
    #[must_use]
    pub fn new(partitioner: Arc<dyn Partitioner>, bucket_bits: u8) -> Self {
        Self {
            partitioner,
            bucket_bits,
            partitions: Mutex::default(),
        }
    }

    #[must_use]
    pub fn partition_of(&self, space_id: &SpaceId) -> PartitionId {
        self.partitioner.partition(space_id)
    }

    /// Records `head` as the latest head of `space_id`.
    pub fn set_head(&self, space_id: &SpaceId, head: Hash) -> PartitionId {
        let partition_id = self.partition_of(space_id);

        let diff = {
            let mut partitions = self.partitions.lock();

            Arc::clone(
                partitions
                    .entry(partition_id)
                    .or_insert_with(|| Arc::new(RwLock::new(RangeDiff::new(self.bucket_bits)))),
            )
        };

        let _previous = diff.write().set(space_id.as_str(), head);

        partition_id
    }

    pub fn get_head(&self, space_id: &SpaceId) -> Result<Hash, HeadIndexError> {
        let Some(diff) = self.partition(self.partition_of(space_id)) else {
            return Err(HeadIndexError::NotFound(space_id.clone()));
        };

        let head = diff.read().element(space_id.as_str());

        head.ok_or_else(|| HeadIndexError::NotFound(space_id.clone()))
    }

    /// Answers `ranges` against a partition, one result per range.
    ///
    /// A partition never populated answers every range with an empty result.
    #[must_use]
    pub fn ranges(&self, partition_id: PartitionId, ranges: &[Range]) -> Vec<RangeResult> {
        let mut results = Vec::with_capacity(ranges.len());
        self.ranges_into(partition_id, ranges, &mut results);
        results
    }

    /// Like [`HeadIndex::ranges`], appending into a caller-owned buffer.
    pub fn ranges_into(
        &self,
        partition_id: PartitionId,
        ranges: &[Range],
        results: &mut Vec<RangeResult>,
    ) {
        let Some(diff) = self.partition(partition_id) else {
            results.extend(ranges.iter().map(|_| RangeResult::empty()));
            return;
        };

        diff.read().ranges_into(ranges, results);
    }

    /// The cached partition-wide aggregate and element count.
    #[must_use]
    pub fn partition_hash(&self, partition_id: PartitionId) -> (Hash, usize) {
        self.partition(partition_id).map_or((Hash::ZERO, 0), |diff| {
            let diff = diff.read();
            (diff.hash(), diff.len())
        })
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.lock().len()
    }

    /// Loads the persisted head of every local space.
    ///
    /// A space that cannot be read is logged and skipped. Each space is closed
    /// again right after its head is read.
    pub async fn warm_up(&self, store: &Store) -> WarmUpStats {
        let mut stats = WarmUpStats::default();

        let space_ids = match store.all_space_ids() {
            Ok(space_ids) => space_ids,
            Err(err) => {
                warn!(%err, "Failed to list spaces for head index warm-up");
                return stats;
            }
        };

        for space_id in space_ids {
            match read_head(store, &space_id).await {
                Ok(head) => {
                    let partition_id = self.set_head(&space_id, head);
                    debug!(%space_id, %partition_id, %head, "Loaded space head");
                    stats.loaded += 1;
                }
                Err(err) => {
                    warn!(%space_id, %err, "Skipping space during head index warm-up");
                    stats.failed += 1;
                }
            }

            let _closed = store.try_close(&space_id, Duration::ZERO);
        }

        info!(
            loaded = stats.loaded,
            failed = stats.failed,
            partitions = self.partition_count(),
            "Head index warm-up finished"
        );

        stats
    }

    fn partition(&self, partition_id: PartitionId) -> Option<Arc<RwLock<RangeDiff>>> {
        self.partitions.lock().get(&partition_id).cloned()
    }
}

async fn read_head(store: &Store, space_id: &SpaceId) -> Result<Hash, StoreError> {
    let access = store.acquire(space_id).await?;

    access.storage()?.head()
}

impl WriteHashObserver for HeadIndex {
    fn on_write_hash(&self, space_id: &SpaceId, head: Hash) {
        let _partition_id = self.set_head(space_id, head);
    }
}

impl fmt::Debug for HeadIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadIndex")
            .field("bucket_bits", &self.bucket_bits)
            .field("partitions", &self.partition_count())
            .finish_non_exhaustive()
    }
}
