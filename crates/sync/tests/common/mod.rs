#![allow(dead_code, reason = "Shared between test binaries")]

use core::future::Future;
use core::num::NonZeroU32;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use eyre::eyre;
use parking_lot::Mutex;
use spacesync_primitives::{Hash, HashPartitioner, PeerId, ReplicaSet, SpaceId};
use spacesync_store::{SpacePayload, Store, StoreConfig};
use spacesync_sync::{
    ColdSyncConfig, ColdSyncResponder, HeadIndex, Reconciliation, SyncServer,
};
use spacesync_sync_primitives::memory::{MemoryStream, Tamper};
use spacesync_sync_primitives::PeerDialer;
use tempfile::TempDir;
use tokio::time::Duration;

pub fn init_tracing() {
    let _ignored = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestStore {
    pub store: Store,
    _dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");

        let store = Store::open(&StoreConfig::new(path)).expect("open store");

        Self { store, _dir: dir }
    }

    /// Names of the entries directly under the store root, sorted.
    pub fn root_entries(&self) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(self.store.root())
            .expect("read root")
            .map(|entry| {
                entry
                    .expect("dir entry")
                    .file_name()
                    .into_string()
                    .expect("utf-8 name")
            })
            .collect();

        names.sort();
        names
    }
}

pub fn space(id: &str) -> SpaceId {
    id.parse().expect("valid space id")
}

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id)
}

pub fn partitioner(count: u32) -> Arc<HashPartitioner> {
    Arc::new(HashPartitioner::new(NonZeroU32::new(count).expect("non-zero")))
}

/// Creates a space holding `trees` tree records besides its acl and
/// settings. Returns the resulting head.
pub async fn seed_space(store: &Store, space_id: &SpaceId, trees: usize) -> Hash {
    let access = store
        .create(
            space_id,
            SpacePayload {
                settings: b"settings".to_vec(),
                acl: b"acl".to_vec(),
            },
        )
        .await
        .expect("create space");

    let storage = access.storage().expect("storage");
    let mut head = storage.head().expect("head");

    for i in 0..trees {
        let data = format!("tree {i} of {space_id};").repeat(i % 7 * 40);
        head = storage
            .put_tree(&format!("t{i}"), data.as_bytes())
            .expect("put tree");
    }

    head
}

pub async fn head_of(store: &Store, space_id: &SpaceId) -> Hash {
    let access = store.acquire(space_id).await.expect("acquire");
    let head = access.storage().expect("storage").head().expect("head");
    head
}

/// The serving end of a dialed stream.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    async fn respond(&self, stream: MemoryStream);
}

#[async_trait]
impl Responder for SyncServer {
    async fn respond(&self, stream: MemoryStream) {
        if let Err(err) = self.handle_stream(stream).await {
            tracing::debug!(%err, "Responder failed");
        }
    }
}

/// Serves streams with a hand-written script instead of a real responder.
pub struct Scripted<F>(pub F);

#[async_trait]
impl<F, Fut> Responder for Scripted<F>
where
    F: Fn(MemoryStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn respond(&self, stream: MemoryStream) {
        (self.0)(stream).await;
    }
}

pub fn server(store: &Store, index: Arc<HeadIndex>, config: ColdSyncConfig) -> Arc<SyncServer> {
    Arc::new(SyncServer::new(
        Reconciliation::new(index),
        ColdSyncResponder::new(store.clone(), config),
        Duration::from_secs(5),
    ))
}

pub fn cold_sync_server(store: &Store) -> Arc<SyncServer> {
    server(
        store,
        Arc::new(HeadIndex::new(partitioner(1), 8)),
        small_chunks(),
    )
}

/// Small chunks so every record spans several frames.
pub fn small_chunks() -> ColdSyncConfig {
    ColdSyncConfig {
        chunk_size: 64,
        ..ColdSyncConfig::default()
    }
}

type TamperFactory = Arc<dyn Fn() -> Tamper + Send + Sync>;

struct Peer {
    responder: Arc<dyn Responder>,
    tamper: Option<TamperFactory>,
}

/// Dials peers registered in-process; each stream is served on its own task.
#[derive(Default)]
pub struct MemoryDialer {
    peers: Mutex<HashMap<PeerId, Peer>>,
    dials: Mutex<Vec<PeerId>>,
}

impl MemoryDialer {
    pub fn add(&self, peer: PeerId, responder: Arc<dyn Responder>) {
        let _prev = self.peers.lock().insert(
            peer,
            Peer {
                responder,
                tamper: None,
            },
        );
    }

    /// Registers a peer whose outgoing frames pass through a fresh `tamper`
    /// hook on every stream.
    pub fn add_tampered<F>(&self, peer: PeerId, responder: Arc<dyn Responder>, tamper: F)
    where
        F: Fn() -> Tamper + Send + Sync + 'static,
    {
        let _prev = self.peers.lock().insert(
            peer,
            Peer {
                responder,
                tamper: Some(Arc::new(tamper)),
            },
        );
    }

    pub fn dials(&self) -> Vec<PeerId> {
        self.dials.lock().clone()
    }
}

#[async_trait]
impl PeerDialer for MemoryDialer {
    type Stream = MemoryStream;

    async fn open_stream(&self, peer: &PeerId) -> eyre::Result<MemoryStream> {
        self.dials.lock().push(peer.clone());

        let (responder, tamper) = {
            let peers = self.peers.lock();
            let entry = peers.get(peer).ok_or_else(|| eyre!("unknown peer {peer}"))?;

            (Arc::clone(&entry.responder), entry.tamper.clone())
        };

        let (local, mut remote) = MemoryStream::pair();

        if let Some(tamper) = tamper {
            remote.set_tamper(tamper());
        }

        drop(tokio::spawn(async move { responder.respond(remote).await }));

        Ok(local)
    }
}

/// Fixed replica list, the same for every space.
pub struct StaticReplicas(pub Vec<PeerId>);

impl ReplicaSet for StaticReplicas {
    fn node_ids(&self, _space_id: &SpaceId) -> Vec<PeerId> {
        self.0.clone()
    }
}
