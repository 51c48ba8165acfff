mod common;

use std::fs;
use std::sync::Arc;

use common::{partitioner, seed_space, space, TestStore};
use spacesync_store::WriteHashObserver;
use spacesync_sync::{HeadIndex, HeadIndexError, WarmUpStats};
use spacesync_sync_primitives::Range;
use tokio::time::Duration;

#[tokio::test]
async fn test_warm_up_loads_persisted_heads() {
    let fixture = TestStore::new();
    let store = &fixture.store;

    let alpha = seed_space(store, &space("alpha"), 3).await;
    let beta = seed_space(store, &space("beta"), 0).await;
    let _damaged = seed_space(store, &space("damaged"), 1).await;
    let _closed = store.reap_idle(Duration::ZERO);

    let damaged = store.space_path(&space("damaged"));
    fs::remove_file(damaged.join("acl.rec")).expect("remove acl");
    fs::create_dir(damaged.join("acl.rec")).expect("directory in place of a record");

    let index = HeadIndex::new(partitioner(16), 8);
    let stats = index.warm_up(store).await;

    assert_eq!(stats, WarmUpStats { loaded: 2, failed: 1 });
    assert_eq!(index.get_head(&space("alpha")).expect("alpha"), alpha);
    assert_eq!(index.get_head(&space("beta")).expect("beta"), beta);
    assert!(matches!(
        index.get_head(&space("damaged")),
        Err(HeadIndexError::NotFound(_))
    ));
    assert_eq!(store.container_count(), 0);
}

#[tokio::test]
async fn test_index_follows_store_writes() {
    let fixture = TestStore::new();
    let store = &fixture.store;
    let index = Arc::new(HeadIndex::new(partitioner(4), 8));

    store.register_observer(Arc::clone(&index) as Arc<dyn WriteHashObserver>);

    let id = space("alpha");
    let created = seed_space(store, &id, 0).await;
    assert_eq!(index.get_head(&id).expect("indexed on create"), created);

    let access = store.acquire(&id).await.expect("acquire");
    let written = access
        .storage()
        .expect("storage")
        .put_tree("fresh", b"data")
        .expect("write");

    assert_ne!(written, created);
    assert_eq!(index.get_head(&id).expect("indexed on write"), written);

    let partition = index.partition_of(&id);
    let results = index.ranges(partition, &[Range::WHOLE]);

    assert_eq!(results[0].count, 1);
    assert_eq!(results[0].elements[0].head, written);
}

#[tokio::test]
async fn test_empty_store_warms_up_nothing() {
    let fixture = TestStore::new();
    let index = HeadIndex::new(partitioner(4), 8);

    assert_eq!(index.warm_up(&fixture.store).await, WarmUpStats::default());
    assert_eq!(index.partition_count(), 0);
}
