//! Reference-counted access broker for a single space.
//!
//! A container owns at most one open [`SpaceStorage`] handle. Shared users
//! acquire and release references; writer-class users (create, exclusive)
//! take the container over entirely and can only do so while no reference is
//! outstanding. Closing happens only through [`StorageContainer::try_close`],
//! driven by the idle reaper.

use std::sync::Arc;

use parking_lot::Mutex;
use spacesync_primitives::SpaceId;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::space::SpaceStorage;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container is closing")]
    Closing,

    #[error("container is closed")]
    Closed,

    #[error("a writer holds the container")]
    WriterActive,

    #[error("{0} references outstanding")]
    InUse(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Available,
    Writer,
    Closing,
    Closed,
}

#[derive(Debug)]
struct State {
    mode: Mode,
    refs: usize,
    handle: Option<Arc<SpaceStorage>>,
    last_usage: Instant,
}

#[derive(Debug)]
pub struct StorageContainer {
    space_id: SpaceId,
    state: Mutex<State>,
    changed: Notify,
}

impl StorageContainer {
    #[must_use]
    pub fn new(space_id: SpaceId) -> Self {
        Self {
            space_id,
            state: Mutex::new(State {
                mode: Mode::Available,
                refs: 0,
                handle: None,
                last_usage: Instant::now(),
            }),
            changed: Notify::new(),
        }
    }

    #[must_use]
    pub const fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    /// Resolves once the container closes or a writer releases it.
    ///
    /// Obtain this before attempting an operation so a transition racing the
    /// attempt is not missed.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    #[must_use]
    pub fn refs(&self) -> usize {
        self.state.lock().refs
    }

    /// Takes a shared reference, opening the handle with `open` if needed.
    pub fn acquire<F>(&self, open: F) -> Result<Arc<SpaceStorage>, ContainerError>
    where
        F: FnOnce() -> Result<SpaceStorage, StoreError>,
    {
        let mut state = self.state.lock();

        match state.mode {
            Mode::Closing => return Err(ContainerError::Closing),
            Mode::Closed => return Err(ContainerError::Closed),
            Mode::Writer => return Err(ContainerError::WriterActive),
            Mode::Available => {}
        }

        let handle = match &state.handle {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = Arc::new(open()?);
                state.handle = Some(Arc::clone(&handle));
                handle
            }
        };

        state.refs += 1;
        state.last_usage = Instant::now();

        Ok(handle)
    }

    /// Drops a shared reference. Never closes the container.
    pub fn release(&self) {
        let mut state = self.state.lock();

        if state.refs == 0 {
            warn!(space_id = %self.space_id, "Release without matching acquire");
            return;
        }

        state.refs -= 1;
        state.last_usage = Instant::now();
    }

    /// Closes the container if no references remain and it has been idle for
    /// at least `ttl`. Returns whether it closed.
    pub fn try_close(&self, ttl: Duration) -> bool {
        let handle = {
            let mut state = self.state.lock();

            if state.mode != Mode::Available || state.refs > 0 {
                return false;
            }

            if state.last_usage.elapsed() < ttl {
                return false;
            }

            state.mode = Mode::Closing;
            state.handle.take()
        };

        if let Some(handle) = handle {
            handle.close();
        }

        self.state.lock().mode = Mode::Closed;
        self.changed.notify_waiters();

        debug!(space_id = %self.space_id, "Closed storage container");

        true
    }

    /// Takes writer-class ownership. Rejects while any reference is held.
    pub fn begin_writer(&self) -> Result<(), ContainerError> {
        let mut state = self.state.lock();

        match state.mode {
            Mode::Closing => return Err(ContainerError::Closing),
            Mode::Closed => return Err(ContainerError::Closed),
            Mode::Writer => return Err(ContainerError::WriterActive),
            Mode::Available => {}
        }

        if state.refs > 0 {
            return Err(ContainerError::InUse(state.refs));
        }

        if let Some(handle) = state.handle.take() {
            handle.close();
        }

        state.mode = Mode::Writer;

        Ok(())
    }

    /// Ends writer-class ownership, optionally installing a freshly created
    /// handle on which the caller keeps one shared reference.
    pub fn end_writer(&self, created: Option<Arc<SpaceStorage>>) {
        {
            let mut state = self.state.lock();

            debug_assert_eq!(state.mode, Mode::Writer, "end_writer without begin_writer");

            state.mode = Mode::Available;
            state.last_usage = Instant::now();

            if let Some(handle) = created {
                state.handle = Some(handle);
                state.refs += 1;
            }
        }

        self.changed.notify_waiters();
    }
}
