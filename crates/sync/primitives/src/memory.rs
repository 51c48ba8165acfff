//! In-memory transport over tokio channels.
//!
//! ```text
//!  MemoryStream A               MemoryStream B
//!    tx ─────────────────────────► rx
//!    rx ◄───────────────────────── tx
//! ```
//!
//! Messages are borsh-encoded on the way in and decoded on the way out, so
//! both protocol ends see exactly what they would see over the network.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{bail, eyre, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::transport::SyncTransport;
use crate::wire::StreamMessage;

const DEFAULT_BUFFER_SIZE: usize = 64;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame hook applied to every encoded message before it is delivered.
pub type Tamper = Box<dyn FnMut(&mut Vec<u8>) + Send>;

pub struct MemoryStream {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
    recv_timeout: Duration,
    closed: bool,
    tamper: Option<Tamper>,
}

impl MemoryStream {
    /// Messages sent on one end are received on the other.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with_buffer(DEFAULT_BUFFER_SIZE)
    }

    #[must_use]
    pub fn pair_with_buffer(buffer_size: usize) -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(buffer_size);
        let (tx_b, rx_a) = mpsc::channel(buffer_size);

        (Self::new(tx_a, rx_a), Self::new(tx_b, rx_b))
    }

    fn new(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Some(tx),
            rx,
            recv_timeout: DEFAULT_TIMEOUT,
            closed: false,
            tamper: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.recv_timeout = timeout;
    }

    /// Installs a hook that may rewrite each outgoing encoded frame.
    pub fn set_tamper(&mut self, tamper: Tamper) {
        self.tamper = Some(tamper);
    }
}

#[async_trait]
impl SyncTransport for MemoryStream {
    async fn send(&mut self, message: &StreamMessage<'_>) -> Result<()> {
        if self.closed {
            bail!("stream is closed");
        }

        let tx = self.tx.as_ref().ok_or_else(|| eyre!("no sender available"))?;

        let mut encoded = borsh::to_vec(message)?;

        if let Some(tamper) = &mut self.tamper {
            tamper(&mut encoded);
        }

        tx.send(encoded)
            .await
            .map_err(|_| eyre!("channel closed"))?;

        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<StreamMessage<'static>>> {
        self.recv_timeout(self.recv_timeout).await
    }

    async fn recv_timeout(&mut self, budget: Duration) -> Result<Option<StreamMessage<'static>>> {
        let data = match timeout(budget, self.rx.recv()).await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(None),
            Err(_) => bail!("timeout receiving message"),
        };

        Ok(Some(borsh::from_slice(&data)?))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.tx = None;
        Ok(())
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStream")
            .field("closed", &self.closed)
            .field("tampered", &self.tamper.is_some())
            .finish()
    }
}
