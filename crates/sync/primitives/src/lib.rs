//! Wire types and transport traits shared by sync requesters and responders.

pub mod range;
pub mod transport;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use range::{DiffType, Element, Range, RangeResult};
pub use transport::{PeerDialer, SyncTransport};
pub use wire::{ErrorCode, InitPayload, MessagePayload, StorageType, StreamMessage};
