//! Inbound stream dispatch.

use std::sync::Arc;

use eyre::bail;
use futures_util::{Stream, StreamExt};
use spacesync_sync_primitives::{ErrorCode, InitPayload, StreamMessage, SyncTransport};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coldsync::ColdSyncResponder;
use crate::reconciliation::Reconciliation;

/// Routes each inbound stream to the responder its first message asks for.
#[derive(Debug)]
pub struct SyncServer {
    reconciliation: Reconciliation,
    cold_sync: ColdSyncResponder,
    init_timeout: Duration,
}

impl SyncServer {
    #[must_use]
    pub const fn new(
        reconciliation: Reconciliation,
        cold_sync: ColdSyncResponder,
        init_timeout: Duration,
    ) -> Self {
        Self {
            reconciliation,
            cold_sync,
            init_timeout,
        }
    }

    /// Serves a single inbound stream to completion.
    pub async fn handle_stream<T: SyncTransport>(&self, mut stream: T) -> eyre::Result<()> {
        let Some(message) = stream.recv_timeout(self.init_timeout).await? else {
            debug!("Stream closed before any request");
            return Ok(());
        };

        let (party_id, payload) = match message {
            StreamMessage::Init { party_id, payload } => (party_id, payload),
            other => {
                stream
                    .send(&StreamMessage::Error {
                        code: ErrorCode::UnexpectedMessage,
                    })
                    .await?;

                bail!("expected init message, got {other:?}");
            }
        };

        debug!(%party_id, request = payload.name(), "Handling sync request");

        let result = match payload {
            InitPayload::ColdSync {
                space_id,
                storage_type,
            } => {
                self.cold_sync
                    .handle(&mut stream, &space_id, storage_type)
                    .await
            }
            payload @ (InitPayload::PartitionSync { .. } | InitPayload::HeadSync { .. }) => {
                self.reconciliation.handle(&mut stream, payload).await
            }
        };

        if let Err(err) = stream.close().await {
            debug!(%party_id, %err, "Failed to close sync stream");
        }

        result
    }

    /// Serves every stream `incoming` yields, each on its own task, until the
    /// source ends or `token` is cancelled.
    pub async fn serve<T, S>(self: Arc<Self>, mut incoming: S, token: CancellationToken)
    where
        T: SyncTransport + 'static,
        S: Stream<Item = T> + Unpin + Send,
    {
        info!("Sync server started");

        loop {
            let stream = tokio::select! {
                biased;
                () = token.cancelled() => break,
                stream = incoming.next() => stream,
            };

            let Some(stream) = stream else {
                break;
            };

            let server = Arc::clone(&self);

            drop(tokio::spawn(async move {
                if let Err(err) = server.handle_stream(stream).await {
                    warn!(%err, "Failed to handle sync stream");
                }
            }));
        }

        info!("Sync server stopped");
    }
}
