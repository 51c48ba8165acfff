//! File-per-record space storage.
//!
//! A space is a directory holding one file per record plus `space.head`, the
//! persisted head. The head is the SHA-256 over the sorted list of
//! `(file name, record digest)` pairs and is rewritten on every write.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use spacesync_primitives::{Hash, SpaceId};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::observer::Observers;

pub const HEAD_FILE: &str = "space.head";
pub const SETTINGS_FILE: &str = "settings.rec";
pub const ACL_FILE: &str = "acl.rec";

const TREE_PREFIX: &str = "tree-";
const RECORD_SUFFIX: &str = ".rec";
const MAX_TREE_ID_LEN: usize = 128;

/// A file name recognized as part of a space's storage.
///
/// Anything that does not parse is not storage and is never transferred.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum StorageFile {
    Head,
    Settings,
    Acl,
    Tree(String),
}

impl StorageFile {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            HEAD_FILE => Some(Self::Head),
            SETTINGS_FILE => Some(Self::Settings),
            ACL_FILE => Some(Self::Acl),
            _ => {
                let tree_id = name
                    .strip_prefix(TREE_PREFIX)?
                    .strip_suffix(RECORD_SUFFIX)?;

                is_valid_tree_id(tree_id).then(|| Self::Tree(tree_id.to_owned()))
            }
        }
    }

    pub fn tree(tree_id: &str) -> Result<Self, StoreError> {
        if !is_valid_tree_id(tree_id) {
            return Err(StoreError::InvalidRecord(tree_id.to_owned()));
        }

        Ok(Self::Tree(tree_id.to_owned()))
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::Head => HEAD_FILE.to_owned(),
            Self::Settings => SETTINGS_FILE.to_owned(),
            Self::Acl => ACL_FILE.to_owned(),
            Self::Tree(id) => format!("{TREE_PREFIX}{id}{RECORD_SUFFIX}"),
        }
    }

    #[must_use]
    pub const fn is_record(&self) -> bool {
        !matches!(self, Self::Head)
    }
}

fn is_valid_tree_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TREE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Initial records of a newly created space.
#[derive(Clone, Debug, Default)]
pub struct SpacePayload {
    pub settings: Vec<u8>,
    pub acl: Vec<u8>,
}

#[derive(Debug)]
struct State {
    records: BTreeMap<String, Hash>,
    head: Hash,
    closed: bool,
}

/// An open space.
#[derive(Debug)]
pub struct SpaceStorage {
    space_id: SpaceId,
    path: Utf8PathBuf,
    observers: Observers,
    state: Mutex<State>,
    /// Serializes writes with their notification so observers see heads in
    /// the order they were persisted.
    writer: Mutex<()>,
}

impl SpaceStorage {
    pub(crate) fn create(
        space_id: SpaceId,
        path: Utf8PathBuf,
        payload: &SpacePayload,
        observers: Observers,
    ) -> Result<Self, StoreError> {
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(space_id));
            }
            Err(err) => return Err(err.into()),
        }

        let written = (|| {
            let mut records = BTreeMap::new();

            for (file, data) in [
                (StorageFile::Settings, &payload.settings),
                (StorageFile::Acl, &payload.acl),
            ] {
                let name = file.file_name();
                write_atomic(&path, &name, data)?;
                let _prev = records.insert(name, Hash::new(data));
            }

            let head = compute_head(&records);
            write_atomic(&path, HEAD_FILE, head.as_bytes())?;

            Ok::<_, StoreError>((records, head))
        })();

        let (records, head) = match written {
            Ok(written) => written,
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&path) {
                    warn!(%space_id, error = %cleanup, "Failed to remove partially created space");
                }
                return Err(err);
            }
        };

        debug!(%space_id, %head, "Created space");

        let storage = Self {
            space_id,
            path,
            observers,
            state: Mutex::new(State {
                records,
                head,
                closed: false,
            }),
            writer: Mutex::new(()),
        };

        storage.observers.notify(&storage.space_id, head);

        Ok(storage)
    }

    pub(crate) fn open(
        space_id: SpaceId,
        path: Utf8PathBuf,
        observers: Observers,
    ) -> Result<Self, StoreError> {
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(space_id));
            }
            Err(err) => return Err(err.into()),
        };

        let mut records = BTreeMap::new();
        let mut stored_head = None;

        for entry in entries {
            let entry = entry?;

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            let Some(file) = StorageFile::parse(&name) else {
                debug!(%space_id, file = %name, "Ignoring unrecognized file");
                continue;
            };

            // A storage name on anything but a regular file means the space is damaged.
            if !entry.file_type()?.is_file() {
                return Err(StoreError::InvalidRecord(name));
            }

            if file == StorageFile::Head {
                stored_head = Some(fs::read(entry.path())?);
            } else {
                let data = fs::read(entry.path())?;
                let _prev = records.insert(name, Hash::new(&data));
            }
        }

        let head = compute_head(&records);

        if stored_head.as_deref() != Some(&head.as_bytes()[..]) {
            warn!(%space_id, %head, "Persisted head does not match records, rewriting");
            write_atomic(&path, HEAD_FILE, head.as_bytes())?;
        }

        debug!(%space_id, %head, records = records.len(), "Opened space");

        Ok(Self {
            space_id,
            path,
            observers,
            state: Mutex::new(State {
                records,
                head,
                closed: false,
            }),
            writer: Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The persisted head.
    pub fn head(&self) -> Result<Hash, StoreError> {
        let state = self.state.lock();

        if state.closed {
            return Err(StoreError::Closed);
        }

        Ok(state.head)
    }

    pub fn put_tree(&self, tree_id: &str, data: &[u8]) -> Result<Hash, StoreError> {
        self.write_record(&StorageFile::tree(tree_id)?, data)
    }

    pub fn set_acl(&self, data: &[u8]) -> Result<Hash, StoreError> {
        self.write_record(&StorageFile::Acl, data)
    }

    pub fn set_settings(&self, data: &[u8]) -> Result<Hash, StoreError> {
        self.write_record(&StorageFile::Settings, data)
    }

    pub fn read_record(&self, file: &StorageFile) -> Result<Vec<u8>, StoreError> {
        let name = file.file_name();

        {
            let state = self.state.lock();

            if state.closed {
                return Err(StoreError::Closed);
            }

            if !state.records.contains_key(&name) {
                return Err(StoreError::InvalidRecord(name));
            }
        }

        Ok(fs::read(self.path.join(name))?)
    }

    pub fn tree_ids(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock();

        if state.closed {
            return Err(StoreError::Closed);
        }

        Ok(state
            .records
            .keys()
            .filter_map(|name| match StorageFile::parse(name) {
                Some(StorageFile::Tree(id)) => Some(id),
                _ => None,
            })
            .collect())
    }

    /// Number of records (trees, acl and settings).
    pub fn record_count(&self) -> Result<usize, StoreError> {
        let state = self.state.lock();

        if state.closed {
            return Err(StoreError::Closed);
        }

        Ok(state.records.len())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();

        if !state.closed {
            state.closed = true;
            debug!(space_id = %self.space_id, "Closed space");
        }
    }

    fn write_record(&self, file: &StorageFile, data: &[u8]) -> Result<Hash, StoreError> {
        let _writer = self.writer.lock();

        let head = {
            let mut state = self.state.lock();

            if state.closed {
                return Err(StoreError::Closed);
            }

            let name = file.file_name();
            write_atomic(&self.path, &name, data)?;
            let _prev = state.records.insert(name, Hash::new(data));

            let head = compute_head(&state.records);
            write_atomic(&self.path, HEAD_FILE, head.as_bytes())?;
            state.head = head;

            head
        };

        self.observers.notify(&self.space_id, head);

        Ok(head)
    }
}

fn compute_head(records: &BTreeMap<String, Hash>) -> Hash {
    Hash::of_parts(
        records
            .iter()
            .flat_map(|(name, digest)| [name.as_bytes(), &digest.as_bytes()[..]]),
    )
}

fn write_atomic(dir: &Utf8Path, name: &str, data: &[u8]) -> io::Result<()> {
    let tmp = dir.join(format!(".{name}.tmp"));

    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&tmp, dir.join(name))
}
