//! Wires the sync components to a store and keeps their background tasks.

use std::sync::Arc;

use spacesync_primitives::Partitioner;
use spacesync_store::{Store, WriteHashObserver};
use tracing::info;

use crate::coldsync::ColdSyncResponder;
use crate::config::SyncConfig;
use crate::head_index::{HeadIndex, WarmUpStats};
use crate::hotsync::{HotSync, SpaceCache};
use crate::reconciliation::{Reconciliation, SpaceDiffs};
use crate::scheduler::PeriodicTask;
use crate::server::SyncServer;

#[derive(Debug)]
pub struct SyncService {
    config: SyncConfig,
    store: Store,
    head_index: Arc<HeadIndex>,
    hot_sync: Arc<HotSync>,
    warm_up: WarmUpStats,
    tasks: Vec<PeriodicTask>,
}

impl SyncService {
    /// Loads the head index, subscribes the index and hot sync to store
    /// writes, and starts hot sync ticks and idle container reaping.
    pub async fn start(
        config: SyncConfig,
        store: Store,
        partitioner: Arc<dyn Partitioner>,
        cache: Arc<dyn SpaceCache>,
    ) -> Self {
        let head_index = Arc::new(HeadIndex::new(partitioner, config.head_index_bucket_bits));
        store.register_observer(Arc::clone(&head_index) as Arc<dyn WriteHashObserver>);

        let warm_up = head_index.warm_up(&store).await;

        let hot_sync = Arc::new(HotSync::new(cache, config.hot_sync));
        store.register_observer(Arc::clone(&hot_sync) as Arc<dyn WriteHashObserver>);

        let reaper = {
            let store = store.clone();
            let ttl = config.container_ttl;

            PeriodicTask::spawn("container_reaper", config.reap_interval, move || {
                let store = store.clone();
                async move {
                    let _closed = store.reap_idle(ttl);
                }
            })
        };

        let tasks = vec![hot_sync.start(), reaper];

        info!(
            loaded = warm_up.loaded,
            failed = warm_up.failed,
            "Sync service started"
        );

        Self {
            config,
            store,
            head_index,
            hot_sync,
            warm_up,
            tasks,
        }
    }

    #[must_use]
    pub const fn head_index(&self) -> &Arc<HeadIndex> {
        &self.head_index
    }

    #[must_use]
    pub const fn hot_sync(&self) -> &Arc<HotSync> {
        &self.hot_sync
    }

    #[must_use]
    pub const fn warm_up(&self) -> WarmUpStats {
        self.warm_up
    }

    /// A server answering peers from this node's index and store.
    #[must_use]
    pub fn server(&self, space_diffs: Option<Arc<dyn SpaceDiffs>>) -> SyncServer {
        let mut reconciliation = Reconciliation::new(Arc::clone(&self.head_index));

        if let Some(space_diffs) = space_diffs {
            reconciliation = reconciliation.with_space_diffs(space_diffs);
        }

        SyncServer::new(
            reconciliation,
            ColdSyncResponder::new(self.store.clone(), self.config.cold_sync),
            self.config.reconciliation.recv_timeout,
        )
    }

    /// Stops every background task, waiting for ticks in flight.
    pub async fn stop(self) {
        for task in self.tasks {
            let name = task.name();
            task.stop().await;
            info!(task = name, "Stopped");
        }
    }
}
