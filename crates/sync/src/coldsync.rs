//! Cold sync: bulk transfer of a space this node does not have at all.
//!
//! The requester takes an exclusive grant on the space, dials the peer and
//! receives every storage file as a run of gzip chunks, each checked against
//! its CRC32 before it is decompressed into a staging directory. Only a
//! complete transfer is promoted into place; anything else drops the staging
//! directory and the grant.
//!
//! The responder takes the same exclusive grant on its copy, so the files it
//! streams cannot change underneath it.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use spacesync_primitives::{PeerId, ReplicaSet, SpaceId};
use spacesync_store::{Store, StoreError, StorageFile};
use spacesync_sync_primitives::{
    ErrorCode, InitPayload, MessagePayload, PeerDialer, StorageType, StreamMessage, SyncTransport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ColdSyncConfig;
use crate::sequencer::Sequencer;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compressed chunks buffered between the compressor and the stream.
const CHUNK_QUEUE: usize = 2;

#[derive(Debug, Error)]
pub enum ColdSyncError {
    #[error("space {0} already exists")]
    SpaceExists(SpaceId),

    #[error("space {0} is busy")]
    Busy(SpaceId),

    #[error("incorrect file: {0:?}")]
    IncorrectFile(String),

    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("unsupported storage type {0}")]
    UnsupportedStorageType(StorageType),

    #[error("peer refused: {0}")]
    Remote(ErrorCode),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(eyre::Report),

    #[error("no replica could serve {0}")]
    NoReplica(SpaceId),

    #[error("transfer cancelled: deadline elapsed")]
    Cancelled,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ColdSyncError {
    /// Whether the same transfer may succeed if attempted again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Busy(_) | Self::Transport(_) | Self::Cancelled => true,
            Self::Remote(code) => code.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for ColdSyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy(space_id) => Self::Busy(space_id),
            StoreError::AlreadyExists(space_id) => Self::SpaceExists(space_id),
            StoreError::Io(err) => Self::Io(err),
            err => Self::Store(err),
        }
    }
}

impl From<eyre::Report> for ColdSyncError {
    fn from(err: eyre::Report) -> Self {
        Self::Transport(err)
    }
}

/// What a successful transfer moved.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransferStats {
    pub files: u64,
    /// Compressed bytes received.
    pub bytes: u64,
}

/// Requesting side of cold sync.
#[derive(Debug)]
pub struct ColdSync<D> {
    local: PeerId,
    store: Store,
    dialer: Arc<D>,
    config: ColdSyncConfig,
}

impl<D: PeerDialer> ColdSync<D> {
    #[must_use]
    pub fn new(local: PeerId, store: Store, dialer: Arc<D>, config: ColdSyncConfig) -> Self {
        Self {
            local,
            store,
            dialer,
            config,
        }
    }

    /// Replicates `space_id` from `peer`.
    ///
    /// Fails without touching anything if the space already exists locally.
    /// On any failure, including the deadline elapsing, nothing of the
    /// transfer remains on disk.
    pub async fn sync(
        &self,
        space_id: &SpaceId,
        peer: &PeerId,
    ) -> Result<TransferStats, ColdSyncError> {
        info!(%space_id, %peer, "Starting cold sync");

        let deadline = Instant::now() + self.config.timeout;
        let result = self.transfer(space_id, peer, deadline).await;

        match &result {
            Ok(stats) => info!(
                %space_id,
                %peer,
                files = stats.files,
                bytes = stats.bytes,
                "Cold sync finished"
            ),
            Err(err) => warn!(%space_id, %peer, %err, "Cold sync failed"),
        }

        result
    }

    /// Tries every replica of `space_id` in preference order until one
    /// transfer succeeds.
    ///
    /// Stops early on failures that another peer cannot fix: the space
    /// already exists, or it is busy locally.
    pub async fn sync_from_replicas(
        &self,
        space_id: &SpaceId,
        replicas: &dyn ReplicaSet,
    ) -> Result<(PeerId, TransferStats), ColdSyncError> {
        let mut last_err = None;

        for peer in replicas.node_ids(space_id) {
            if peer == self.local {
                continue;
            }

            match self.sync(space_id, &peer).await {
                Ok(stats) => return Ok((peer, stats)),
                Err(err @ (ColdSyncError::SpaceExists(_) | ColdSyncError::Busy(_))) => {
                    return Err(err)
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| ColdSyncError::NoReplica(space_id.clone())))
    }

    async fn transfer(
        &self,
        space_id: &SpaceId,
        peer: &PeerId,
        deadline: Instant,
    ) -> Result<TransferStats, ColdSyncError> {
        if self.store.space_exists(space_id) {
            return Err(ColdSyncError::SpaceExists(space_id.clone()));
        }

        debug!(%space_id, "Locking space");

        let grant = self.store.exclusive(space_id).await?;

        if self.store.space_exists(space_id) {
            return Err(ColdSyncError::SpaceExists(space_id.clone()));
        }

        let staging = grant.staging().await?;

        let streaming = self.stream(space_id, peer, staging.path());

        let received = match time::timeout_at(deadline, streaming).await {
            Ok(received) => received,
            Err(_) => Err(ColdSyncError::Cancelled),
        };

        debug!(%space_id, ok = received.is_ok(), "Finalizing transfer");

        let verified = match received {
            Ok(stats) => staging
                .verify()
                .await
                .map(|head| (stats, head))
                .map_err(ColdSyncError::from),
            Err(err) => Err(err),
        };

        let (stats, head) = match verified {
            Ok(verified) => verified,
            Err(err) => {
                staging.discard().await;
                return Err(err);
            }
        };

        let _path = staging.promote().await?;
        drop(grant);

        self.store.publish_head(space_id, head);

        debug!(%space_id, %head, "Promoted transferred space");

        Ok(stats)
    }

    /// Dials `peer` and receives every file of `space_id` into `dir`.
    async fn stream(
        &self,
        space_id: &SpaceId,
        peer: &PeerId,
        dir: &Utf8Path,
    ) -> Result<TransferStats, ColdSyncError> {
        debug!(%space_id, %peer, "Dialing peer");

        let mut stream = self.dialer.open_stream(peer).await?;

        stream
            .send(&StreamMessage::Init {
                party_id: self.local.clone(),
                payload: InitPayload::ColdSync {
                    space_id: space_id.clone(),
                    storage_type: self.config.storage_type,
                },
            })
            .await?;

        debug!(%space_id, %peer, "Streaming files");

        let stats = receive_files(&mut stream, dir, self.config.storage_type).await?;

        if let Err(err) = stream.close().await {
            debug!(%space_id, %err, "Failed to close cold sync stream");
        }

        Ok(stats)
    }
}

/// The file currently being decompressed.
struct Sink {
    name: String,
    decoder: GzDecoder<File>,
}

impl Sink {
    fn create(dir: &Utf8Path, name: String) -> io::Result<Self> {
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(dir.join(&name))?;

        Ok(Self {
            name,
            decoder: GzDecoder::new(file),
        })
    }

    fn finish(self) -> io::Result<String> {
        let file = self.decoder.finish()?;
        file.sync_all()?;

        Ok(self.name)
    }
}

async fn receive_files<T: SyncTransport>(
    stream: &mut T,
    dir: &Utf8Path,
    storage_type: StorageType,
) -> Result<TransferStats, ColdSyncError> {
    let mut sequencer = Sequencer::default();
    let mut stats = TransferStats::default();
    let mut seen = HashSet::new();
    let mut current: Option<Sink> = None;

    loop {
        let Some(message) = stream.recv().await? else {
            return Err(ColdSyncError::Protocol(
                "stream closed before the transfer ended".to_owned(),
            ));
        };

        let payload = match message {
            StreamMessage::Message {
                sequence_id,
                payload,
            } => {
                sequencer
                    .expect(sequence_id)
                    .map_err(|err| ColdSyncError::Protocol(err.to_string()))?;
                payload
            }
            StreamMessage::Error { code } => {
                return Err(match code {
                    ErrorCode::UnsupportedStorageType => {
                        ColdSyncError::UnsupportedStorageType(storage_type)
                    }
                    code => ColdSyncError::Remote(code),
                });
            }
            StreamMessage::Init { .. } => {
                return Err(ColdSyncError::Protocol("unexpected init message".to_owned()));
            }
        };

        match payload {
            MessagePayload::ColdSyncChunk {
                filename,
                data,
                crc32,
                storage_type: remote_type,
            } => {
                if remote_type != storage_type {
                    return Err(ColdSyncError::UnsupportedStorageType(remote_type));
                }

                if StorageFile::parse(&filename).is_none() {
                    return Err(ColdSyncError::IncorrectFile(filename));
                }

                if crc32fast::hash(&data) != crc32 {
                    return Err(ColdSyncError::ChecksumMismatch(filename));
                }

                let previous = current.take();
                let switching = !matches!(&previous, Some(sink) if sink.name == filename);

                if switching && !seen.insert(filename.clone()) {
                    return Err(ColdSyncError::IncorrectFile(filename));
                }

                stats.bytes += data.len() as u64;

                let dir = dir.to_owned();
                let (sink, finished) = blocking(move || {
                    let (mut sink, finished) = match previous {
                        Some(sink) if !switching => (sink, None),
                        previous => {
                            let finished = previous.map(Sink::finish).transpose()?;
                            (Sink::create(&dir, filename)?, finished)
                        }
                    };

                    sink.decoder.write_all(&data)?;

                    Ok((sink, finished))
                })
                .await?;

                if let Some(name) = finished {
                    debug!(file = %name, "Received file");
                    stats.files += 1;
                }

                current = Some(sink);
            }
            MessagePayload::ColdSyncEnd { files } => {
                if let Some(sink) = current.take() {
                    let name = blocking(move || sink.finish()).await?;
                    debug!(file = %name, "Received file");
                    stats.files += 1;
                }

                if files != stats.files {
                    return Err(ColdSyncError::Protocol(format!(
                        "peer announced {files} files, received {}",
                        stats.files
                    )));
                }

                return Ok(stats);
            }
            MessagePayload::PartitionSync { .. } | MessagePayload::HeadSync { .. } => {
                return Err(ColdSyncError::Protocol("unexpected message".to_owned()));
            }
        }
    }
}

/// Runs file and gzip work on the blocking pool.
async fn blocking<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> io::Result<R> + Send + 'static,
    R: Send + 'static,
{
    task::spawn_blocking(f).await.map_err(io::Error::other)?
}

/// Serving side of cold sync.
#[derive(Clone, Debug)]
pub struct ColdSyncResponder {
    store: Store,
    config: ColdSyncConfig,
}

impl ColdSyncResponder {
    #[must_use]
    pub fn new(store: Store, config: ColdSyncConfig) -> Self {
        Self { store, config }
    }

    /// Streams every storage file of `space_id` to the requester.
    ///
    /// Refusals (unknown space, busy space, storage type mismatch) are sent
    /// to the requester as an error frame and are not errors here.
    pub async fn handle<T: SyncTransport>(
        &self,
        stream: &mut T,
        space_id: &SpaceId,
        storage_type: StorageType,
    ) -> eyre::Result<()> {
        if storage_type != self.config.storage_type {
            warn!(
                %space_id,
                local = %self.config.storage_type,
                remote = %storage_type,
                "Refusing cold sync: unsupported storage type"
            );
            return refuse(stream, ErrorCode::UnsupportedStorageType).await;
        }

        let grant = match self.store.exclusive(space_id).await {
            Ok(grant) => grant,
            Err(StoreError::Busy(_)) => {
                debug!(%space_id, "Refusing cold sync: space busy");
                return refuse(stream, ErrorCode::SpaceBusy).await;
            }
            Err(err) => return Err(err.into()),
        };

        let dir = grant.path().to_owned();
        let Some(files) = task::spawn_blocking(move || storage_files(&dir)).await?? else {
            debug!(%space_id, "Refusing cold sync: space not found");
            return refuse(stream, ErrorCode::SpaceNotFound).await;
        };

        let mut sequencer = Sequencer::default();
        let mut bytes = 0;

        for (name, path) in files.iter().cloned() {
            bytes += self.send_file(stream, &mut sequencer, name, path).await?;
        }

        stream
            .send(&StreamMessage::Message {
                sequence_id: sequencer.next(),
                payload: MessagePayload::ColdSyncEnd {
                    files: files.len() as u64,
                },
            })
            .await?;

        info!(%space_id, files = files.len(), bytes, "Served cold sync");

        Ok(())
    }

    /// Sends one file as it is compressed on the blocking pool, one frame per
    /// chunk. Returns compressed bytes sent.
    async fn send_file<T: SyncTransport>(
        &self,
        stream: &mut T,
        sequencer: &mut Sequencer,
        name: String,
        path: Utf8PathBuf,
    ) -> eyre::Result<u64> {
        let chunk_size = self.config.chunk_size.max(1);
        let (tx, mut rx) = mpsc::channel(CHUNK_QUEUE);

        let compressing = task::spawn_blocking(move || compress_file(&path, chunk_size, &tx));

        let mut sent = 0;

        while let Some(chunk) = rx.recv().await {
            stream
                .send(&StreamMessage::Message {
                    sequence_id: sequencer.next(),
                    payload: MessagePayload::ColdSyncChunk {
                        filename: name.clone(),
                        data: Cow::Borrowed(chunk.as_slice()),
                        crc32: crc32fast::hash(&chunk),
                        storage_type: self.config.storage_type,
                    },
                })
                .await?;

            sent += chunk.len() as u64;
        }

        compressing.await??;

        debug!(file = %name, bytes = sent, "Sent file");

        Ok(sent)
    }
}

async fn refuse<T: SyncTransport>(stream: &mut T, code: ErrorCode) -> eyre::Result<()> {
    stream.send(&StreamMessage::Error { code }).await
}

/// Regular storage files directly inside `dir`, sorted by name, or `None` if
/// `dir` is not a directory.
fn storage_files(dir: &Utf8Path) -> eyre::Result<Option<Vec<(String, Utf8PathBuf)>>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut files = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;

        if !entry.file_type().is_file() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };

        if StorageFile::parse(name).is_none() {
            debug!(file = %name, "Skipping non-storage file");
            continue;
        }

        let path = Utf8PathBuf::from_path_buf(entry.path().to_path_buf())
            .map_err(|path| eyre::eyre!("non UTF-8 path: {}", path.display()))?;

        files.push((name.to_owned(), path));
    }

    Ok(Some(files))
}

/// Reads and compresses `path`, handing every full chunk of compressed output
/// to `chunks` and the tail once the file ends.
fn compress_file(
    path: &Utf8Path,
    chunk_size: usize,
    chunks: &mpsc::Sender<Vec<u8>>,
) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(chunk_size), Compression::default());
    let mut buffer = vec![0; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;

        if read == 0 {
            break;
        }

        encoder.write_all(&buffer[..read])?;

        let pending = encoder.get_mut();

        while pending.len() >= chunk_size {
            let rest = pending.split_off(chunk_size);
            send_chunk(chunks, mem::replace(pending, rest))?;
        }
    }

    let mut pending = encoder.finish()?;

    while !pending.is_empty() {
        let rest = pending.split_off(pending.len().min(chunk_size));
        send_chunk(chunks, mem::replace(&mut pending, rest))?;
    }

    Ok(())
}

fn send_chunk(chunks: &mpsc::Sender<Vec<u8>>, chunk: Vec<u8>) -> io::Result<()> {
    chunks
        .blocking_send(chunk)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "chunk receiver dropped"))
}
