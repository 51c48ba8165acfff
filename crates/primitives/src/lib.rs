//! Identifiers and collaborator traits shared by the storage and sync crates.

pub mod hash;
pub mod partition;
pub mod space;

pub use hash::Hash;
pub use partition::{HashPartitioner, PartitionId, Partitioner, ReplicaSet};
pub use space::{InvalidSpaceId, PeerId, SpaceId};
