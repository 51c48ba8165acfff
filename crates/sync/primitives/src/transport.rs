//! Transport abstraction for sync protocols.
//!
//! Protocol code only ever talks to a [`SyncTransport`], so the same
//! requester and responder logic runs over network streams in production and
//! over in-memory channels in tests.

use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use spacesync_primitives::PeerId;

use crate::wire::StreamMessage;

/// A bidirectional message stream with one peer.
#[async_trait]
pub trait SyncTransport: Send {
    /// Send a message to the peer.
    async fn send(&mut self, message: &StreamMessage<'_>) -> Result<()>;

    /// Receive a message from the peer.
    ///
    /// Returns `Ok(None)` if the stream is closed.
    async fn recv(&mut self) -> Result<Option<StreamMessage<'static>>>;

    /// Receive a message, failing once `timeout` elapses.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<StreamMessage<'static>>>;

    /// Close the transport. Further sends fail.
    async fn close(&mut self) -> Result<()>;
}

/// Opens outbound streams to peers.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    type Stream: SyncTransport;

    async fn open_stream(&self, peer: &PeerId) -> Result<Self::Stream>;
}
