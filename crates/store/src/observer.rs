use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use spacesync_primitives::{Hash, SpaceId};

/// Notified after a space's head has been persisted.
///
/// Called synchronously from the write path once the write is durable. Writes
/// to one space are delivered in the order they were persisted, so an observer
/// should return quickly and must not write back into the same space.
pub trait WriteHashObserver: Send + Sync {
    fn on_write_hash(&self, space_id: &SpaceId, head: Hash);
}

/// Registry of write-hash observers shared by every open space.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<RwLock<Vec<Arc<dyn WriteHashObserver>>>>,
}

impl Observers {
    pub fn register(&self, observer: Arc<dyn WriteHashObserver>) {
        self.inner.write().push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub(crate) fn notify(&self, space_id: &SpaceId, head: Hash) {
        let observers = self.inner.read().clone();

        for observer in observers {
            observer.on_write_hash(space_id, head);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.len())
            .finish()
    }
}
