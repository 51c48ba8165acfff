//! Hot sync: keeps a bounded, rotating set of recently changed spaces awake.
//!
//! Changed space ids accumulate in a deduplicated FIFO backlog. Every tick
//! first puts idle active spaces back to sleep, then wakes as many backlog
//! spaces as there is free capacity. Waking happens through the upstream
//! space cache; a space that fails to load is dropped and only comes back
//! with its next change notification.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use spacesync_primitives::{Hash, SpaceId};
use spacesync_store::WriteHashObserver;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::HotSyncConfig;
use crate::scheduler::PeriodicTask;

/// The cache of loaded spaces hot sync keeps awake.
#[async_trait]
pub trait SpaceCache: Send + Sync {
    /// Loads the space if it is not resident yet.
    async fn get(&self, space_id: &SpaceId) -> eyre::Result<()>;

    /// Last use of a resident space, without loading or touching it.
    fn pick(&self, space_id: &SpaceId) -> Option<Instant>;

    /// Unloads the space. Returns whether it was resident.
    async fn remove(&self, space_id: &SpaceId) -> eyre::Result<bool>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HotSyncStats {
    pub backlog: usize,
    pub active: usize,
}

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TickOutcome {
    /// Active spaces put to sleep for being idle.
    pub evicted: usize,
    /// Active spaces no longer resident in the cache.
    pub gone: usize,
    pub admitted: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct State {
    backlog: VecDeque<SpaceId>,
    queued: HashSet<SpaceId>,
    active: HashSet<SpaceId>,
}

pub struct HotSync {
    cache: Arc<dyn SpaceCache>,
    config: HotSyncConfig,
    state: Mutex<State>,
    ticking: AsyncMutex<()>,
}

impl HotSync {
    #[must_use]
    pub fn new(cache: Arc<dyn SpaceCache>, config: HotSyncConfig) -> Self {
        Self {
            cache,
            config,
            state: Mutex::default(),
            ticking: AsyncMutex::new(()),
        }
    }

    /// Merges changed ids into the backlog.
    ///
    /// Ids already queued keep their position and new ids are appended in the
    /// given order. Active ids are queued too, so a change arriving while a
    /// space is active survives its eviction.
    pub fn update_queue<I>(&self, changed: I)
    where
        I: IntoIterator<Item = SpaceId>,
    {
        let mut state = self.state.lock();
        let State { backlog, queued, .. } = &mut *state;

        for space_id in changed {
            if queued.contains(&space_id) {
                continue;
            }

            let _inserted = queued.insert(space_id.clone());
            backlog.push_back(space_id);
        }
    }

    #[must_use]
    pub fn stats(&self) -> HotSyncStats {
        let state = self.state.lock();

        HotSyncStats {
            backlog: state.backlog.len(),
            active: state.active.len(),
        }
    }

    /// The backlog, oldest first.
    #[must_use]
    pub fn backlog(&self) -> Vec<SpaceId> {
        self.state.lock().backlog.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_active(&self, space_id: &SpaceId) -> bool {
        self.state.lock().active.contains(space_id)
    }

    /// Runs one eviction and admission round. Concurrent calls run one
    /// after another.
    pub async fn tick(&self) -> TickOutcome {
        let _ticking = self.ticking.lock().await;

        let mut outcome = TickOutcome::default();

        self.evict(&mut outcome).await;
        self.admit(&mut outcome).await;

        let stats = self.stats();

        debug!(
            evicted = outcome.evicted,
            gone = outcome.gone,
            admitted = outcome.admitted,
            failed = outcome.failed,
            backlog = stats.backlog,
            active = stats.active,
            "Hot sync tick"
        );

        outcome
    }

    /// Ticks every `tick_interval` until the returned task is stopped.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> PeriodicTask {
        let hot_sync = Arc::clone(self);

        PeriodicTask::spawn("hot_sync", self.config.tick_interval, move || {
            let hot_sync = Arc::clone(&hot_sync);
            async move {
                let _outcome = hot_sync.tick().await;
            }
        })
    }

    async fn evict(&self, outcome: &mut TickOutcome) {
        let active: Vec<_> = self.state.lock().active.iter().cloned().collect();
        let now = Instant::now();

        for space_id in active {
            match self.cache.pick(&space_id) {
                None => {
                    debug!(%space_id, "Active space no longer cached");
                    outcome.gone += 1;
                }
                Some(last_usage)
                    if now.saturating_duration_since(last_usage) >= self.config.idle_threshold =>
                {
                    if let Err(err) = self.cache.remove(&space_id).await {
                        warn!(%space_id, %err, "Failed to unload idle space");
                    }

                    debug!(%space_id, "Evicted idle space");
                    outcome.evicted += 1;
                }
                Some(_) => continue,
            }

            let _removed = self.state.lock().active.remove(&space_id);
        }
    }

    async fn admit(&self, outcome: &mut TickOutcome) {
        let batch: Vec<_> = {
            let mut state = self.state.lock();
            let free = self.config.max_active.saturating_sub(state.active.len());
            let take = free.min(state.backlog.len());

            let batch: Vec<_> = state.backlog.drain(..take).collect();

            for space_id in &batch {
                let _removed = state.queued.remove(space_id);
            }

            batch
        };

        for space_id in batch {
            match self.cache.get(&space_id).await {
                Ok(()) => {
                    let _inserted = self.state.lock().active.insert(space_id);
                    outcome.admitted += 1;
                }
                Err(err) => {
                    warn!(%space_id, %err, "Failed to wake space, dropping it");
                    outcome.failed += 1;
                }
            }
        }
    }
}

impl WriteHashObserver for HotSync {
    fn on_write_hash(&self, space_id: &SpaceId, _head: Hash) {
        self.update_queue([space_id.clone()]);
    }
}

impl fmt::Debug for HotSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();

        f.debug_struct("HotSync")
            .field("config", &self.config)
            .field("backlog", &stats.backlog)
            .field("active", &stats.active)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use eyre::bail;
    use tokio::time::{self, Duration};

    use super::*;

    #[derive(Default)]
    struct MockCache {
        resident: Mutex<HashMap<SpaceId, Instant>>,
        broken: Mutex<HashSet<SpaceId>>,
    }

    #[async_trait]
    impl SpaceCache for MockCache {
        async fn get(&self, space_id: &SpaceId) -> eyre::Result<()> {
            if self.broken.lock().contains(space_id) {
                bail!("cannot load {space_id}");
            }

            let _prev = self
                .resident
                .lock()
                .insert(space_id.clone(), Instant::now());
            Ok(())
        }

        fn pick(&self, space_id: &SpaceId) -> Option<Instant> {
            self.resident.lock().get(space_id).copied()
        }

        async fn remove(&self, space_id: &SpaceId) -> eyre::Result<bool> {
            Ok(self.resident.lock().remove(space_id).is_some())
        }
    }

    fn ids<const N: usize>(names: [&str; N]) -> Vec<SpaceId> {
        names
            .iter()
            .map(|name| name.parse().expect("valid id"))
            .collect()
    }

    fn numbered(prefix: &str, n: usize) -> Vec<SpaceId> {
        (0..n)
            .map(|i| format!("{prefix}{i}").parse().expect("valid id"))
            .collect()
    }

    fn hot_sync(cache: &Arc<MockCache>, max_active: usize) -> HotSync {
        HotSync::new(
            Arc::clone(cache) as Arc<dyn SpaceCache>,
            HotSyncConfig {
                max_active,
                idle_threshold: Duration::from_secs(20),
                tick_interval: Duration::from_secs(5),
            },
        )
    }

    #[test]
    fn test_update_queue_dedupes() {
        let hot_sync = hot_sync(&Arc::default(), 10);

        hot_sync.update_queue(ids(["a"]));
        hot_sync.update_queue(ids(["a", "b"]));

        assert_eq!(hot_sync.backlog(), ids(["a", "b"]));
    }

    #[test]
    fn test_update_queue_keeps_first_seen_order() {
        let hot_sync = hot_sync(&Arc::default(), 10);

        hot_sync.update_queue(ids(["c", "a"]));
        hot_sync.update_queue(ids(["b", "a", "c", "d", "b"]));

        assert_eq!(hot_sync.backlog(), ids(["c", "a", "b", "d"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_capacity() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 3);

        hot_sync.update_queue(numbered("s", 5));
        let outcome = hot_sync.tick().await;

        assert_eq!(outcome.admitted, 3);
        assert_eq!(
            hot_sync.stats(),
            HotSyncStats {
                backlog: 2,
                active: 3
            }
        );
        assert_eq!(hot_sync.backlog(), numbered("s", 5)[3..].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_members_rotate_out() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 4);

        hot_sync.update_queue(numbered("first", 4));
        assert_eq!(hot_sync.tick().await.admitted, 4);

        hot_sync.update_queue(numbered("second", 6));

        time::advance(Duration::from_secs(21)).await;
        let outcome = hot_sync.tick().await;

        assert_eq!(outcome.evicted, 4);
        assert_eq!(outcome.admitted, 4);
        assert_eq!(hot_sync.stats().active, 4);
        assert_eq!(hot_sync.stats().backlog, 2);

        for space_id in numbered("first", 4) {
            assert!(!hot_sync.is_active(&space_id));
            assert!(cache.pick(&space_id).is_none());
        }
        for space_id in &numbered("second", 6)[..4] {
            assert!(hot_sync.is_active(space_id));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_members_stay() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 2);

        hot_sync.update_queue(numbered("s", 2));
        let _outcome = hot_sync.tick().await;

        time::advance(Duration::from_secs(10)).await;
        hot_sync.update_queue(numbered("t", 2));
        let outcome = hot_sync.tick().await;

        assert_eq!(outcome.evicted, 0);
        assert_eq!(outcome.admitted, 0);
        assert_eq!(hot_sync.stats().backlog, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_members_evicted_elsewhere_are_dropped() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 2);

        hot_sync.update_queue(numbered("s", 2));
        let _outcome = hot_sync.tick().await;

        let _prev = cache.resident.lock().remove(&numbered("s", 1)[0]);
        hot_sync.update_queue(numbered("t", 1));

        let outcome = hot_sync.tick().await;

        assert_eq!(outcome.gone, 1);
        assert_eq!(outcome.admitted, 1);
        assert_eq!(hot_sync.stats().active, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_admission_is_dropped() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 5);
        let bad: SpaceId = "bad".parse().expect("valid id");
        let _inserted = cache.broken.lock().insert(bad.clone());

        hot_sync.update_queue(ids(["x", "bad", "y"]));
        let outcome = hot_sync.tick().await;

        assert_eq!(outcome.admitted, 2);
        assert_eq!(outcome.failed, 1);
        assert!(!hot_sync.is_active(&bad));
        assert!(hot_sync.backlog().is_empty());

        let outcome = hot_sync.tick().await;
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_never_exceeded() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 7);

        for round in 0..10 {
            hot_sync.update_queue(numbered(&format!("r{round}x"), 5));
            let _outcome = hot_sync.tick().await;

            assert!(hot_sync.stats().active <= 7);
            time::advance(Duration::from_secs(9)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_ids_are_requeued() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 2);

        hot_sync.update_queue(ids(["a"]));
        let _outcome = hot_sync.tick().await;

        hot_sync.on_write_hash(&ids(["a"])[0], Hash::ZERO);
        hot_sync.on_write_hash(&ids(["b"])[0], Hash::ZERO);

        assert!(hot_sync.is_active(&ids(["a"])[0]));
        assert_eq!(hot_sync.backlog(), ids(["a", "b"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_while_active_outlives_eviction() {
        let cache = Arc::new(MockCache::default());
        let hot_sync = hot_sync(&cache, 2);
        let a = &ids(["a"])[0];

        hot_sync.update_queue(ids(["a"]));
        assert_eq!(hot_sync.tick().await.admitted, 1);

        time::advance(Duration::from_secs(19)).await;
        hot_sync.update_queue(ids(["a"]));
        time::advance(Duration::from_secs(2)).await;

        let outcome = hot_sync.tick().await;

        assert_eq!(outcome.evicted, 1);
        assert_eq!(outcome.admitted, 1);
        assert!(hot_sync.is_active(a));
        assert!(cache.pick(a).is_some());
        assert!(hot_sync.backlog().is_empty());
    }
}
