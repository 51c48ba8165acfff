//! On-disk space storage and the access broker in front of it.
//!
//! Every space lives in its own directory under the store root. Access to a
//! space always goes through a [`SpaceAccess`] grant handed out by
//! [`Store::access`], which arbitrates shared users against writer-class
//! users (create, exclusive) through a per-space [`StorageContainer`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use spacesync_primitives::{Hash, SpaceId};
use tokio::time::Duration;
use tracing::{debug, warn};

pub mod access;
pub mod config;
pub mod container;
pub mod error;
pub mod observer;
pub mod space;
pub mod staging;

pub use access::{AccessKind, AccessRequest, SpaceAccess};
pub use config::StoreConfig;
use container::ContainerError;
pub use container::StorageContainer;
pub use error::StoreError;
pub use observer::{Observers, WriteHashObserver};
pub use space::{SpacePayload, SpaceStorage, StorageFile};
pub use staging::StagingDir;

#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: Utf8PathBuf,
    containers: Mutex<HashMap<SpaceId, Arc<StorageContainer>>>,
    observers: Observers,
}

impl Store {
    /// Opens the store, creating the root if needed and discarding any
    /// staging directory left behind by an interrupted transfer.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.path)?;

        for entry in fs::read_dir(&config.path)? {
            let entry = entry?;

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            if staging::is_staging_name(&name) && entry.file_type()?.is_dir() {
                warn!(path = %config.path.join(&name), "Removing leftover staging directory");
                fs::remove_dir_all(entry.path())?;
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                root: config.path.clone(),
                containers: Mutex::default(),
                observers: Observers::default(),
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.inner.root
    }

    #[must_use]
    pub fn observers(&self) -> &Observers {
        &self.inner.observers
    }

    pub fn register_observer(&self, observer: Arc<dyn WriteHashObserver>) {
        self.inner.observers.register(observer);
    }

    /// Tells observers about a head that did not come from a local write,
    /// such as a space promoted from a completed transfer.
    pub fn publish_head(&self, space_id: &SpaceId, head: Hash) {
        self.inner.observers.notify(space_id, head);
    }

    #[must_use]
    pub fn space_path(&self, space_id: &SpaceId) -> Utf8PathBuf {
        self.inner.root.join(space_id.as_str())
    }

    #[must_use]
    pub fn staging_path(&self, space_id: &SpaceId) -> Utf8PathBuf {
        self.inner.root.join(staging::staging_name(space_id))
    }

    #[must_use]
    pub fn space_exists(&self, space_id: &SpaceId) -> bool {
        self.space_path(space_id).is_dir()
    }

    /// Every space persisted under the root, in no particular order.
    pub fn all_space_ids(&self) -> Result<Vec<SpaceId>, StoreError> {
        let entries = match fs::read_dir(&self.inner.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();

        for entry in entries {
            let entry = entry?;

            if !entry.file_type()?.is_dir() {
                continue;
            }

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            match name.parse() {
                Ok(id) => ids.push(id),
                Err(err) => debug!(%name, %err, "Skipping non-space directory"),
            }
        }

        Ok(ids)
    }

    /// Number of containers currently tracked, open or not.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.inner.containers.lock().len()
    }

    pub async fn acquire(&self, space_id: &SpaceId) -> Result<SpaceAccess, StoreError> {
        self.access(space_id, AccessRequest::Shared).await
    }

    pub async fn create(
        &self,
        space_id: &SpaceId,
        payload: SpacePayload,
    ) -> Result<SpaceAccess, StoreError> {
        self.access(space_id, AccessRequest::Create(payload)).await
    }

    pub async fn exclusive(&self, space_id: &SpaceId) -> Result<SpaceAccess, StoreError> {
        self.access(space_id, AccessRequest::Exclusive).await
    }

    /// Grants the requested access.
    ///
    /// Shared requests wait out a writer or a close in flight. Writer-class
    /// requests never wait: they fail with [`StoreError::Busy`] while anyone
    /// else holds the space.
    pub async fn access(
        &self,
        space_id: &SpaceId,
        request: AccessRequest,
    ) -> Result<SpaceAccess, StoreError> {
        let kind = request.kind();

        loop {
            let container = self.container(space_id);
            let changed = container.changed();

            let attempt = match &request {
                AccessRequest::Shared => self.try_shared(space_id, &container),
                AccessRequest::Create(payload) => self.try_create(space_id, &container, payload),
                AccessRequest::Exclusive => self.try_exclusive(space_id, &container),
            };

            match attempt {
                Ok(access) => return Ok(access),
                Err(ContainerError::Closed) => {
                    self.forget(space_id, &container);
                }
                Err(ContainerError::Closing) => {
                    debug!(%space_id, ?kind, "Waiting for container to close");
                    changed.await;
                }
                Err(ContainerError::WriterActive) if kind == AccessKind::Shared => {
                    debug!(%space_id, "Waiting for writer to finish");
                    changed.await;
                }
                Err(ContainerError::WriterActive) => {
                    return Err(StoreError::Busy(space_id.clone()));
                }
                Err(ContainerError::InUse(refs)) => {
                    debug!(%space_id, refs, ?kind, "Space in use");

                    return Err(match kind {
                        AccessKind::Create => StoreError::AlreadyExists(space_id.clone()),
                        AccessKind::Shared | AccessKind::Exclusive => {
                            StoreError::Busy(space_id.clone())
                        }
                    });
                }
                Err(ContainerError::Store(err)) => return Err(err),
            }
        }
    }

    /// Closes the space's container if it is unreferenced and idle for `ttl`.
    pub fn try_close(&self, space_id: &SpaceId, ttl: Duration) -> bool {
        let Some(container) = self.inner.containers.lock().get(space_id).cloned() else {
            return false;
        };

        let closed = container.try_close(ttl);

        if closed {
            self.forget(space_id, &container);
        }

        closed
    }

    /// Closes every container idle for at least `ttl`. Returns how many closed.
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let containers: Vec<_> = self
            .inner
            .containers
            .lock()
            .iter()
            .map(|(id, container)| (id.clone(), Arc::clone(container)))
            .collect();

        let mut closed = 0;

        for (space_id, container) in containers {
            if container.try_close(ttl) {
                self.forget(&space_id, &container);
                closed += 1;
            }
        }

        if closed > 0 {
            debug!(closed, remaining = self.container_count(), "Reaped idle containers");
        }

        closed
    }

    fn try_shared(
        &self,
        space_id: &SpaceId,
        container: &Arc<StorageContainer>,
    ) -> Result<SpaceAccess, ContainerError> {
        let path = self.space_path(space_id);

        let storage = container.acquire(|| {
            SpaceStorage::open(
                space_id.clone(),
                path.clone(),
                self.inner.observers.clone(),
            )
        })?;

        Ok(self.grant(AccessKind::Shared, space_id, container, Some(storage)))
    }

    fn try_create(
        &self,
        space_id: &SpaceId,
        container: &Arc<StorageContainer>,
        payload: &SpacePayload,
    ) -> Result<SpaceAccess, ContainerError> {
        container.begin_writer()?;

        let created = SpaceStorage::create(
            space_id.clone(),
            self.space_path(space_id),
            payload,
            self.inner.observers.clone(),
        );

        match created {
            Ok(storage) => {
                let storage = Arc::new(storage);
                container.end_writer(Some(Arc::clone(&storage)));

                Ok(self.grant(AccessKind::Create, space_id, container, Some(storage)))
            }
            Err(err) => {
                container.end_writer(None);
                Err(err.into())
            }
        }
    }

    fn try_exclusive(
        &self,
        space_id: &SpaceId,
        container: &Arc<StorageContainer>,
    ) -> Result<SpaceAccess, ContainerError> {
        container.begin_writer()?;

        debug!(%space_id, "Granted exclusive access");

        Ok(self.grant(AccessKind::Exclusive, space_id, container, None))
    }

    fn grant(
        &self,
        kind: AccessKind,
        space_id: &SpaceId,
        container: &Arc<StorageContainer>,
        storage: Option<Arc<SpaceStorage>>,
    ) -> SpaceAccess {
        SpaceAccess::new(
            kind,
            space_id.clone(),
            self.space_path(space_id),
            self.staging_path(space_id),
            Arc::clone(container),
            storage,
        )
    }

    fn container(&self, space_id: &SpaceId) -> Arc<StorageContainer> {
        let mut containers = self.inner.containers.lock();

        Arc::clone(
            containers
                .entry(space_id.clone())
                .or_insert_with(|| Arc::new(StorageContainer::new(space_id.clone()))),
        )
    }

    fn forget(&self, space_id: &SpaceId, container: &Arc<StorageContainer>) {
        let mut containers = self.inner.containers.lock();

        if containers
            .get(space_id)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, container))
        {
            let _removed = containers.remove(space_id);
        }
    }
}
