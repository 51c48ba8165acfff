use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use spacesync_primitives::SpaceId;

use crate::container::StorageContainer;
use crate::error::StoreError;
use crate::space::{SpacePayload, SpaceStorage};
use crate::staging::StagingDir;

/// What a caller wants from a space's storage.
#[derive(Clone, Debug)]
pub enum AccessRequest {
    /// Open (or reuse) the handle alongside other shared users.
    Shared,
    /// Materialize the space for the first time.
    Create(SpacePayload),
    /// Run alone: nothing else may open the space until the grant drops.
    Exclusive,
}

impl AccessRequest {
    #[must_use]
    pub const fn kind(&self) -> AccessKind {
        match self {
            Self::Shared => AccessKind::Shared,
            Self::Create(_) => AccessKind::Create,
            Self::Exclusive => AccessKind::Exclusive,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Shared,
    Create,
    Exclusive,
}

/// A granted access to one space. Released when dropped.
///
/// Shared and create grants hold one reference on the container and expose
/// the open [`SpaceStorage`]. An exclusive grant holds no handle at all; the
/// space's directory is only reachable through its path and
/// [`SpaceAccess::staging`].
#[derive(Debug)]
pub struct SpaceAccess {
    kind: AccessKind,
    space_id: SpaceId,
    path: Utf8PathBuf,
    staging_path: Utf8PathBuf,
    container: Arc<StorageContainer>,
    storage: Option<Arc<SpaceStorage>>,
}

impl SpaceAccess {
    pub(crate) const fn new(
        kind: AccessKind,
        space_id: SpaceId,
        path: Utf8PathBuf,
        staging_path: Utf8PathBuf,
        container: Arc<StorageContainer>,
        storage: Option<Arc<SpaceStorage>>,
    ) -> Self {
        Self {
            kind,
            space_id,
            path,
            staging_path,
            container,
            storage,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> AccessKind {
        self.kind
    }

    #[must_use]
    pub const fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    /// Directory of the space, whether or not it exists yet.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn storage(&self) -> Result<&Arc<SpaceStorage>, StoreError> {
        self.storage
            .as_ref()
            .ok_or(StoreError::WrongAccess(self.kind))
    }

    /// Creates a fresh staging directory for this space. Exclusive only.
    pub async fn staging(&self) -> Result<StagingDir<'_>, StoreError> {
        if self.kind != AccessKind::Exclusive {
            return Err(StoreError::WrongAccess(self.kind));
        }

        StagingDir::create(
            self.space_id.clone(),
            self.staging_path.clone(),
            self.path.clone(),
        )
        .await
    }
}

impl Drop for SpaceAccess {
    fn drop(&mut self) {
        match self.kind {
            AccessKind::Shared | AccessKind::Create => self.container.release(),
            AccessKind::Exclusive => self.container.end_writer(None),
        }
    }
}
