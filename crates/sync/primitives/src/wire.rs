//! Wire protocol types for sync stream communication.
//!
//! Every inbound stream opens with a [`StreamMessage::Init`] naming the
//! request; the responder answers with one or more [`StreamMessage::Message`]
//! frames, or a single [`StreamMessage::Error`].
//!
//! ```text
//! Initiator                                   Responder
//! │ ── Init { PartitionSync } ──────────────► │
//! │ ◄── Message { PartitionSync } ─────────── │
//!
//! │ ── Init { ColdSync } ───────────────────► │
//! │ ◄── Message { ColdSyncChunk } ─────────── │  one per flushed chunk
//! │ ◄── Message { ColdSyncChunk } ─────────── │
//! │ ◄── Message { ColdSyncEnd } ───────────── │
//! ```

use std::borrow::Cow;
use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use spacesync_primitives::{PartitionId, PeerId, SpaceId};

use crate::range::{DiffType, Range, RangeResult};

/// Storage-protocol tag both cold sync ends declare.
///
/// Peers with different tags lay out space directories differently and must
/// never exchange files.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct StorageType(u16);

impl StorageType {
    /// One file per record, with a persisted `space.head`.
    pub const FILE_RECORD_V1: Self = Self(1);

    #[must_use]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl Default for StorageType {
    fn default() -> Self {
        Self::FILE_RECORD_V1
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, BorshSerialize, BorshDeserialize)]
pub enum StreamMessage<'a> {
    Init {
        /// Identity of the requesting node.
        party_id: PeerId,
        payload: InitPayload,
    },
    Message {
        sequence_id: u64,
        payload: MessagePayload<'a>,
    },
    /// The request failed on the responder; ends the stream.
    Error { code: ErrorCode },
}

#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum InitPayload {
    /// Range queries against a partition's head index.
    PartitionSync {
        partition_id: PartitionId,
        diff_type: DiffType,
        ranges: Vec<Range>,
    },

    /// Range queries against one space's object-level diff.
    HeadSync {
        space_id: SpaceId,
        diff_type: DiffType,
        ranges: Vec<Range>,
    },

    /// Stream every storage file of a space.
    ColdSync {
        space_id: SpaceId,
        storage_type: StorageType,
    },
}

impl InitPayload {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PartitionSync { .. } => "partition_sync",
            Self::HeadSync { .. } => "head_sync",
            Self::ColdSync { .. } => "cold_sync",
        }
    }
}

#[derive(Debug, BorshSerialize, BorshDeserialize)]
pub enum MessagePayload<'a> {
    PartitionSync {
        diff_type: DiffType,
        results: Vec<RangeResult>,
    },

    HeadSync {
        diff_type: DiffType,
        results: Vec<RangeResult>,
    },

    /// One compressed chunk of a storage file.
    ///
    /// Chunks of one file are contiguous; a new `filename` starts a new file.
    ColdSyncChunk {
        filename: String,
        data: Cow<'a, [u8]>,
        crc32: u32,
        storage_type: StorageType,
    },

    /// Every file has been sent.
    ColdSyncEnd { files: u64 },
}

/// Why a responder refused or aborted a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum ErrorCode {
    SpaceNotFound,
    SpaceBusy,
    UnsupportedStorageType,
    UnexpectedMessage,
    Internal,
}

impl ErrorCode {
    /// Whether the same request may succeed if retried later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::SpaceBusy)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::SpaceNotFound => "space not found",
            Self::SpaceBusy => "space busy",
            Self::UnsupportedStorageType => "unsupported storage type",
            Self::UnexpectedMessage => "unexpected message",
            Self::Internal => "internal error",
        })
    }
}

#[cfg(test)]
mod tests {
    use spacesync_primitives::Hash;

    use super::*;
    use crate::range::Element;

    #[test]
    fn test_chunk_decodes_owned() {
        let data = vec![1_u8, 2, 3];

        let message = StreamMessage::Message {
            sequence_id: 4,
            payload: MessagePayload::ColdSyncChunk {
                filename: "acl.rec".to_owned(),
                data: Cow::Borrowed(&data),
                crc32: 7,
                storage_type: StorageType::FILE_RECORD_V1,
            },
        };

        let encoded = borsh::to_vec(&message).expect("encode");
        drop(data);

        let decoded = borsh::from_slice::<StreamMessage<'static>>(&encoded).expect("decode");

        let StreamMessage::Message {
            sequence_id,
            payload:
                MessagePayload::ColdSyncChunk {
                    filename,
                    data,
                    crc32,
                    ..
                },
        } = decoded
        else {
            panic!("unexpected message: {decoded:?}");
        };

        assert_eq!(sequence_id, 4);
        assert_eq!(filename, "acl.rec");
        assert_eq!(&*data, &[1, 2, 3]);
        assert_eq!(crc32, 7);
    }

    #[test]
    fn test_invalid_space_id_rejected_on_decode() {
        let valid = InitPayload::ColdSync {
            space_id: "ab".parse().expect("valid id"),
            storage_type: StorageType::default(),
        };

        let mut encoded = borsh::to_vec(&valid).expect("encode");

        // variant tag, then a u32 length, then the id bytes
        let id_start = 1 + 4;
        encoded[id_start..id_start + 2].copy_from_slice(b"..");

        assert!(borsh::from_slice::<InitPayload>(&encoded).is_err());
    }

    #[test]
    fn test_partition_response_shape() {
        let results = vec![RangeResult {
            hash: Hash::new(b"leaf"),
            count: 1,
            elements: vec![Element {
                id: "space".to_owned(),
                head: Hash::new(b"head"),
            }],
        }];

        let encoded = borsh::to_vec(&MessagePayload::PartitionSync {
            diff_type: DiffType::Initial,
            results: results.clone(),
        })
        .expect("encode");

        let MessagePayload::PartitionSync {
            diff_type,
            results: decoded,
        } = borsh::from_slice(&encoded).expect("decode")
        else {
            panic!("unexpected payload");
        };

        assert_eq!(diff_type, DiffType::Initial);
        assert_eq!(decoded, results);
    }
}
