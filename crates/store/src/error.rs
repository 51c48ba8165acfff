use std::io;

use spacesync_primitives::SpaceId;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("space {0} not found")]
    NotFound(SpaceId),

    #[error("space {0} already exists")]
    AlreadyExists(SpaceId),

    #[error("space {0} is busy")]
    Busy(SpaceId),

    #[error("storage handle is closed")]
    Closed,

    #[error("access kind {0:?} does not allow this operation")]
    WrongAccess(crate::AccessKind),

    #[error("invalid record name: {0}")]
    InvalidRecord(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether the caller may retry the same operation later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
