#![allow(dead_code, reason = "Shared between test binaries")]

use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use spacesync_primitives::{Hash, SpaceId};
use spacesync_store::{SpacePayload, Store, StoreConfig, WriteHashObserver};
use tempfile::TempDir;

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
}

pub fn space(id: &str) -> SpaceId {
    id.parse().expect("valid space id")
}

pub fn payload() -> SpacePayload {
    SpacePayload {
        settings: b"settings".to_vec(),
        acl: b"acl".to_vec(),
    }
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub seen: Mutex<Vec<(SpaceId, Hash)>>,
}

impl WriteHashObserver for RecordingObserver {
    fn on_write_hash(&self, space_id: &SpaceId, head: Hash) {
        self.seen.lock().push((space_id.clone(), head));
    }
}

pub fn recording_observer(store: &Store) -> Arc<RecordingObserver> {
    let observer = Arc::new(RecordingObserver::default());
    store.register_observer(Arc::clone(&observer) as Arc<dyn WriteHashObserver>);
    observer
}
