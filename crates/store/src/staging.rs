use core::marker::PhantomData;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use spacesync_primitives::{Hash, SpaceId};
use tokio::task;
use tracing::{debug, warn};

use crate::access::SpaceAccess;
use crate::error::StoreError;
use crate::observer::Observers;
use crate::space::SpaceStorage;

pub(crate) const STAGING_SUFFIX: &str = ".coldsync";

/// Name of the staging directory for a space; hidden so it is never taken for
/// a space itself.
pub(crate) fn staging_name(space_id: &SpaceId) -> String {
    format!(".{space_id}{STAGING_SUFFIX}")
}

pub(crate) fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

/// A pristine directory that is promoted to a space directory on success.
///
/// Filesystem work runs on the blocking pool. Dropping it without
/// [`StagingDir::promote`] or [`StagingDir::discard`] still removes the
/// directory, inline, so a cancelled transfer leaves nothing behind.
/// Borrows the exclusive grant it was created under, so it cannot outlive it.
#[derive(Debug)]
pub struct StagingDir<'a> {
    space_id: SpaceId,
    path: Utf8PathBuf,
    target: Utf8PathBuf,
    settled: bool,
    _grant: PhantomData<&'a SpaceAccess>,
}

impl StagingDir<'_> {
    pub(crate) async fn create(
        space_id: SpaceId,
        path: Utf8PathBuf,
        target: Utf8PathBuf,
    ) -> Result<Self, StoreError> {
        {
            let space_id = space_id.clone();
            let path = path.clone();

            blocking(move || {
                match fs::remove_dir_all(&path) {
                    Ok(()) => warn!(%space_id, %path, "Removed leftover staging directory"),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }

                Ok(fs::create_dir_all(&path)?)
            })
            .await?;
        }

        Ok(Self {
            space_id,
            path,
            target,
            settled: false,
            _grant: PhantomData,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Opens the staged files as a space and returns its head.
    ///
    /// Fails the same way opening the promoted space would, so a damaged
    /// transfer is caught while it is still invisible.
    pub async fn verify(&self) -> Result<Hash, StoreError> {
        let space_id = self.space_id.clone();
        let path = self.path.clone();

        blocking(move || SpaceStorage::open(space_id, path, Observers::default())?.head()).await
    }

    /// Atomically renames the staging directory onto the space directory.
    ///
    /// On failure the staging directory is discarded.
    pub async fn promote(mut self) -> Result<Utf8PathBuf, StoreError> {
        let space_id = self.space_id.clone();
        let path = self.path.clone();
        let target = self.target.clone();

        let renamed = blocking(move || {
            if target.exists() {
                return Err(StoreError::AlreadyExists(space_id));
            }

            fs::rename(&path, &target)?;

            Ok(target)
        })
        .await;

        match renamed {
            Ok(target) => {
                self.settled = true;
                debug!(space_id = %self.space_id, %target, "Promoted staging directory");
                Ok(target)
            }
            Err(err) => {
                self.discard().await;
                Err(err)
            }
        }
    }

    /// Removes the staging directory and everything written into it.
    pub async fn discard(mut self) {
        self.settled = true;

        let space_id = self.space_id.clone();
        let path = self.path.clone();

        if let Err(err) = task::spawn_blocking(move || remove(&space_id, &path)).await {
            warn!(space_id = %self.space_id, error = %err, "Staging removal task failed");
        }
    }
}

impl Drop for StagingDir<'_> {
    fn drop(&mut self) {
        if !self.settled {
            remove(&self.space_id, &self.path);
        }
    }
}

fn remove(space_id: &SpaceId, path: &Utf8Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(%space_id, "Removed staging directory"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(%space_id, error = %err, "Failed to remove staging directory");
        }
    }
}

async fn blocking<F, R>(f: F) -> Result<R, StoreError>
where
    F: FnOnce() -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| StoreError::Io(io::Error::other(err)))?
}
