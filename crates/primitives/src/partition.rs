//! Partition assignment.
//!
//! Spaces are bucketed into a fixed number of partitions; each partition is
//! reconciled with peers as a unit. The ring that decides which nodes are
//! responsible for a space is maintained elsewhere and consumed through
//! [`ReplicaSet`].

use core::num::NonZeroU32;
use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::space::{PeerId, SpaceId};

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Deserialize,
    Serialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Maps spaces onto partitions. Must be a pure function of the space id.
pub trait Partitioner: Send + Sync {
    fn partition(&self, space_id: &SpaceId) -> PartitionId;

    fn partition_count(&self) -> u32;
}

/// Nodes responsible for a space, in preference order.
pub trait ReplicaSet: Send + Sync {
    fn node_ids(&self, space_id: &SpaceId) -> Vec<PeerId>;
}

/// Partitions spaces by the first eight bytes of the SHA-256 of their id.
#[derive(Clone, Copy, Debug)]
pub struct HashPartitioner {
    partition_count: NonZeroU32,
}

impl HashPartitioner {
    #[must_use]
    pub const fn new(partition_count: NonZeroU32) -> Self {
        Self { partition_count }
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, space_id: &SpaceId) -> PartitionId {
        let digest = Sha256::digest(space_id.as_str().as_bytes());

        let mut prefix = [0; 8];
        prefix.copy_from_slice(&digest[..8]);

        let bucket = u64::from_be_bytes(prefix) % u64::from(self.partition_count.get());

        #[allow(clippy::cast_possible_truncation, reason = "bounded by partition_count")]
        let bucket = bucket as u32;

        PartitionId(bucket)
    }

    fn partition_count(&self) -> u32 {
        self.partition_count.get()
    }
}
