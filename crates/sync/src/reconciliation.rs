//! Range queries over the head index, answered for and asked of peers.
//!
//! The recursive comparison that narrows a mismatch down to single spaces
//! belongs to the caller; this module only answers range queries and carries
//! them over the wire. A request tagged [`DiffType::Precalculated`] for the
//! whole key domain is answered from the cached aggregate and tagged the same
//! way, so the caller never mistakes it for an ordinary single-leaf result.

use std::fmt;
use std::sync::Arc;

use eyre::{bail, OptionExt};
use parking_lot::RwLock;
use spacesync_primitives::{Hash, PartitionId, PeerId, SpaceId};
use spacesync_sync_primitives::{
    DiffType, ErrorCode, InitPayload, MessagePayload, PeerDialer, Range, RangeResult,
    StreamMessage, SyncTransport,
};
use tracing::debug;

use crate::config::ReconciliationConfig;
use crate::head_index::{HeadIndex, RangeDiff};

/// A reconciliation stream carries exactly one reply.
const REPLY_SEQUENCE_ID: u64 = 0;

/// Object-level diffs of the spaces this node holds, for head sync.
pub trait SpaceDiffs: Send + Sync {
    fn space_diff(&self, space_id: &SpaceId) -> Option<Arc<RwLock<RangeDiff>>>;
}

fn is_precalculated_probe(diff_type: DiffType, ranges: &[Range]) -> bool {
    diff_type == DiffType::Precalculated
        && matches!(ranges, [range] if range.is_whole() && range.limit == 1)
}

fn precalculated(hash: Hash, len: usize) -> Vec<RangeResult> {
    vec![RangeResult {
        hash,
        count: u32::try_from(len).unwrap_or(u32::MAX),
        elements: Vec::new(),
    }]
}

/// Answers range queries from the local head index and space diffs.
#[derive(Clone)]
pub struct Reconciliation {
    index: Arc<HeadIndex>,
    spaces: Option<Arc<dyn SpaceDiffs>>,
}

impl Reconciliation {
    #[must_use]
    pub const fn new(index: Arc<HeadIndex>) -> Self {
        Self {
            index,
            spaces: None,
        }
    }

    #[must_use]
    pub fn with_space_diffs(mut self, spaces: Arc<dyn SpaceDiffs>) -> Self {
        self.spaces = Some(spaces);
        self
    }

    #[must_use]
    pub fn partition_sync(
        &self,
        partition_id: PartitionId,
        diff_type: DiffType,
        ranges: &[Range],
    ) -> (DiffType, Vec<RangeResult>) {
        if is_precalculated_probe(diff_type, ranges) {
            let (hash, len) = self.index.partition_hash(partition_id);
            return (DiffType::Precalculated, precalculated(hash, len));
        }

        (DiffType::Initial, self.index.ranges(partition_id, ranges))
    }

    pub fn head_sync(
        &self,
        space_id: &SpaceId,
        diff_type: DiffType,
        ranges: &[Range],
    ) -> Result<(DiffType, Vec<RangeResult>), ErrorCode> {
        let diff = self
            .spaces
            .as_ref()
            .and_then(|spaces| spaces.space_diff(space_id))
            .ok_or(ErrorCode::SpaceNotFound)?;

        let diff = diff.read();

        if is_precalculated_probe(diff_type, ranges) {
            return Ok((DiffType::Precalculated, precalculated(diff.hash(), diff.len())));
        }

        Ok((DiffType::Initial, diff.ranges(ranges)))
    }

    /// Answers one request on `stream`. Requests other than partition and
    /// head sync are refused.
    pub async fn handle<T: SyncTransport>(
        &self,
        stream: &mut T,
        payload: InitPayload,
    ) -> eyre::Result<()> {
        let reply = match payload {
            InitPayload::PartitionSync {
                partition_id,
                diff_type,
                ranges,
            } => {
                let (diff_type, results) = self.partition_sync(partition_id, diff_type, &ranges);

                debug!(%partition_id, ranges = ranges.len(), ?diff_type, "Answered partition sync");

                Ok(MessagePayload::PartitionSync { diff_type, results })
            }
            InitPayload::HeadSync {
                space_id,
                diff_type,
                ranges,
            } => self
                .head_sync(&space_id, diff_type, &ranges)
                .map(|(diff_type, results)| MessagePayload::HeadSync { diff_type, results }),
            InitPayload::ColdSync { .. } => Err(ErrorCode::UnexpectedMessage),
        };

        let message = match reply {
            Ok(payload) => StreamMessage::Message {
                sequence_id: REPLY_SEQUENCE_ID,
                payload,
            },
            Err(code) => StreamMessage::Error { code },
        };

        stream.send(&message).await
    }
}

/// Asks peers for range results: the remote side of a diff walk.
#[derive(Debug)]
pub struct ReconciliationClient<D> {
    local: PeerId,
    dialer: Arc<D>,
    config: ReconciliationConfig,
}

impl<D: PeerDialer> ReconciliationClient<D> {
    #[must_use]
    pub const fn new(local: PeerId, dialer: Arc<D>, config: ReconciliationConfig) -> Self {
        Self {
            local,
            dialer,
            config,
        }
    }

    pub async fn partition_ranges(
        &self,
        peer: &PeerId,
        partition_id: PartitionId,
        diff_type: DiffType,
        ranges: Vec<Range>,
    ) -> eyre::Result<(DiffType, Vec<RangeResult>)> {
        let expected = ranges.len();

        let payload = self
            .request(
                peer,
                InitPayload::PartitionSync {
                    partition_id,
                    diff_type,
                    ranges,
                },
            )
            .await?;

        let MessagePayload::PartitionSync { diff_type, results } = payload else {
            bail!("unexpected response to partition sync");
        };

        check_len(expected, &results)?;

        Ok((diff_type, results))
    }

    pub async fn head_ranges(
        &self,
        peer: &PeerId,
        space_id: &SpaceId,
        diff_type: DiffType,
        ranges: Vec<Range>,
    ) -> eyre::Result<(DiffType, Vec<RangeResult>)> {
        let expected = ranges.len();

        let payload = self
            .request(
                peer,
                InitPayload::HeadSync {
                    space_id: space_id.clone(),
                    diff_type,
                    ranges,
                },
            )
            .await?;

        let MessagePayload::HeadSync { diff_type, results } = payload else {
            bail!("unexpected response to head sync");
        };

        check_len(expected, &results)?;

        Ok((diff_type, results))
    }

    async fn request(
        &self,
        peer: &PeerId,
        payload: InitPayload,
    ) -> eyre::Result<MessagePayload<'static>> {
        let mut stream = self.dialer.open_stream(peer).await?;

        stream
            .send(&StreamMessage::Init {
                party_id: self.local.clone(),
                payload,
            })
            .await?;

        let message = stream
            .recv_timeout(self.config.recv_timeout)
            .await?
            .ok_or_eyre("stream closed before response")?;

        if let Err(err) = stream.close().await {
            debug!(%peer, %err, "Failed to close reconciliation stream");
        }

        match message {
            StreamMessage::Message {
                sequence_id,
                payload,
            } => {
                if sequence_id != REPLY_SEQUENCE_ID {
                    bail!("unexpected sequence id {sequence_id} for a single reply");
                }

                Ok(payload)
            }
            StreamMessage::Error { code } => bail!("peer refused: {code}"),
            StreamMessage::Init { .. } => bail!("unexpected init message"),
        }
    }
}

fn check_len(expected: usize, results: &[RangeResult]) -> eyre::Result<()> {
    if results.len() != expected {
        bail!(
            "expected {} range results, received {}",
            expected,
            results.len()
        );
    }

    Ok(())
}

impl fmt::Debug for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciliation")
            .field("index", &self.index)
            .field("space_diffs", &self.spaces.is_some())
            .finish()
    }
}
