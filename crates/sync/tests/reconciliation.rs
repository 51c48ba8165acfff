mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{partitioner, peer, server, space, MemoryDialer, Scripted, TestStore};
use parking_lot::RwLock;
use spacesync_primitives::{Hash, PartitionId, SpaceId};
use spacesync_sync::{
    ColdSyncConfig, ColdSyncResponder, HeadIndex, RangeDiff, Reconciliation,
    ReconciliationClient, ReconciliationConfig, SpaceDiffs, SyncServer,
};
use spacesync_sync_primitives::memory::MemoryStream;
use spacesync_sync_primitives::{
    DiffType, MessagePayload, Range, RangeResult, StreamMessage, SyncTransport,
};
use tokio::time::Duration;

const PARTITION: PartitionId = PartitionId::new(0);

fn index_with(spaces: impl IntoIterator<Item = (String, Hash)>) -> Arc<HeadIndex> {
    let index = Arc::new(HeadIndex::new(partitioner(1), 4));

    for (id, head) in spaces {
        let _partition = index.set_head(&space(&id), head);
    }

    index
}

fn spaces(count: usize) -> Vec<(String, Hash)> {
    (0..count)
        .map(|i| (format!("s{i}"), Hash::new(format!("head {i}").as_bytes())))
        .collect()
}

struct Fixture {
    _store: TestStore,
    remote: Arc<HeadIndex>,
    client: ReconciliationClient<MemoryDialer>,
}

fn fixture(remote: Arc<HeadIndex>) -> Fixture {
    let store = TestStore::new();
    let dialer = Arc::new(MemoryDialer::default());

    dialer.add(
        peer("remote"),
        server(&store.store, Arc::clone(&remote), ColdSyncConfig::default()),
    );

    Fixture {
        _store: store,
        remote,
        client: ReconciliationClient::new(peer("local"), dialer, ReconciliationConfig::default()),
    }
}

/// Narrows the difference between `local` and the remote partition down to
/// the ids whose heads differ, the way a caller walks the ranges.
async fn diverging(
    client: &ReconciliationClient<MemoryDialer>,
    local: &HeadIndex,
) -> BTreeSet<String> {
    let mut pending = vec![Range::new(0, u64::MAX, 4)];
    let mut found = BTreeSet::new();

    while let Some(range) = pending.pop() {
        let ours = local.ranges(PARTITION, &[range]).remove(0);

        let (_, mut theirs) = client
            .partition_ranges(&peer("remote"), PARTITION, DiffType::Initial, vec![range])
            .await
            .expect("remote ranges");
        let theirs = theirs.remove(0);

        if ours.hash == theirs.hash {
            continue;
        }

        if ours.count <= range.limit && theirs.count <= range.limit {
            let ours: BTreeSet<_> = ours.elements.into_iter().collect();
            let theirs: BTreeSet<_> = theirs.elements.into_iter().collect();

            found.extend(ours.symmetric_difference(&theirs).map(|e| e.id.clone()));
            continue;
        }

        if let Some((left, right)) = range.split() {
            pending.push(left);
            pending.push(right);
        }
    }

    found
}

#[tokio::test]
async fn test_remote_ranges_match_remote_index() {
    let Fixture { remote, client, .. } = fixture(index_with(spaces(50)));

    let ranges = vec![
        Range::new(0, u64::MAX / 2, 100),
        Range::new(u64::MAX / 2 + 1, u64::MAX, 1),
    ];

    let (diff_type, results) = client
        .partition_ranges(&peer("remote"), PARTITION, DiffType::Initial, ranges.clone())
        .await
        .expect("partition sync");

    assert_eq!(diff_type, DiffType::Initial);
    assert_eq!(results, remote.ranges(PARTITION, &ranges));
    assert_eq!(results[0].count + results[1].count, 50);
    assert_eq!(results[0].elements.len(), results[0].count as usize);
}

#[tokio::test]
async fn test_precalculated_probe_compares_partitions() {
    let Fixture { remote, client, .. } = fixture(index_with(spaces(50)));
    let local = index_with(spaces(50));

    let (diff_type, results) = client
        .partition_ranges(&peer("remote"), PARTITION, DiffType::Precalculated, vec![Range::WHOLE])
        .await
        .expect("probe");

    assert_eq!(diff_type, DiffType::Precalculated);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].count, 50);
    assert!(results[0].elements.is_empty());
    assert_eq!(results[0].hash, local.partition_hash(PARTITION).0);

    let _partition = remote.set_head(&space("s3"), Hash::new(b"diverged"));

    let (_, results) = client
        .partition_ranges(&peer("remote"), PARTITION, DiffType::Precalculated, vec![Range::WHOLE])
        .await
        .expect("probe");

    assert_ne!(results[0].hash, local.partition_hash(PARTITION).0);
}

#[tokio::test]
async fn test_single_element_probe_is_not_a_leaf() {
    let Fixture { client, .. } = fixture(index_with(spaces(1)));

    let (diff_type, results) = client
        .partition_ranges(&peer("remote"), PARTITION, DiffType::Precalculated, vec![Range::WHOLE])
        .await
        .expect("probe");

    assert_eq!(diff_type, DiffType::Precalculated);
    assert_eq!(results[0].count, 1);
    assert!(results[0].elements.is_empty());

    let (diff_type, results) = client
        .partition_ranges(&peer("remote"), PARTITION, DiffType::Initial, vec![Range::WHOLE])
        .await
        .expect("initial");

    assert_eq!(diff_type, DiffType::Initial);
    assert_eq!(results[0].elements.len(), 1);
    assert_eq!(results[0].elements[0].id, "s0");
}

#[tokio::test]
async fn test_unknown_partition_is_empty() {
    let Fixture { client, .. } = fixture(index_with(spaces(5)));
    let unknown = PartitionId::new(7);

    let (_, results) = client
        .partition_ranges(
            &peer("remote"),
            unknown,
            DiffType::Initial,
            vec![Range::WHOLE, Range::new(5, 10, 3)],
        )
        .await
        .expect("partition sync");

    assert_eq!(results, vec![RangeResult::empty(), RangeResult::empty()]);

    let (diff_type, results) = client
        .partition_ranges(&peer("remote"), unknown, DiffType::Precalculated, vec![Range::WHOLE])
        .await
        .expect("probe");

    assert_eq!(diff_type, DiffType::Precalculated);
    assert_eq!(results, vec![RangeResult::empty()]);
}

#[tokio::test]
async fn test_reply_must_be_first_message() {
    let dialer = Arc::new(MemoryDialer::default());
    dialer.add(
        peer("remote"),
        Arc::new(Scripted(|mut stream: MemoryStream| async move {
            let _init = stream.recv().await;
            let _sent = stream
                .send(&StreamMessage::Message {
                    sequence_id: 1,
                    payload: MessagePayload::PartitionSync {
                        diff_type: DiffType::Initial,
                        results: vec![RangeResult::empty()],
                    },
                })
                .await;
        })),
    );

    let client = ReconciliationClient::new(peer("local"), dialer, ReconciliationConfig::default());

    let err = client
        .partition_ranges(&peer("remote"), PARTITION, DiffType::Initial, vec![Range::WHOLE])
        .await
        .expect_err("reply out of sequence");

    assert!(err.to_string().contains("sequence id 1"), "{err}");
}

#[tokio::test]
async fn test_walk_finds_diverging_spaces() {
    let mut remote_spaces = spaces(200);
    remote_spaces[7].1 = Hash::new(b"newer head");
    remote_spaces.push(("s999".to_owned(), Hash::new(b"remote only")));

    let Fixture { client, .. } = fixture(index_with(remote_spaces));
    let local = index_with(spaces(200));

    let found = diverging(&client, &local).await;

    assert_eq!(found, BTreeSet::from(["s7".to_owned(), "s999".to_owned()]));
}

#[tokio::test]
async fn test_head_sync_requires_space_diff() {
    let Fixture { client, .. } = fixture(index_with(spaces(1)));

    let err = client
        .head_ranges(&peer("remote"), &space("s0"), DiffType::Initial, vec![Range::WHOLE])
        .await
        .expect_err("no object model behind the server");

    assert!(err.to_string().contains("space not found"), "{err}");
}

struct Diffs(SpaceId, Arc<RwLock<RangeDiff>>);

impl SpaceDiffs for Diffs {
    fn space_diff(&self, space_id: &SpaceId) -> Option<Arc<RwLock<RangeDiff>>> {
        (*space_id == self.0).then(|| Arc::clone(&self.1))
    }
}

#[tokio::test]
async fn test_head_sync_answers_object_ranges() {
    let store = TestStore::new();
    let id = space("alpha");

    let mut diff = RangeDiff::new(4);
    for i in 0..10 {
        let _prev = diff.set(&format!("object-{i}"), Hash::new(format!("{i}").as_bytes()));
    }
    let expected = diff.ranges(&[Range::new(0, u64::MAX, 20)]);
    let whole = diff.hash();

    let reconciliation = Reconciliation::new(index_with(spaces(1)))
        .with_space_diffs(Arc::new(Diffs(id.clone(), Arc::new(RwLock::new(diff)))));

    let dialer = Arc::new(MemoryDialer::default());
    dialer.add(
        peer("remote"),
        Arc::new(SyncServer::new(
            reconciliation,
            ColdSyncResponder::new(store.store.clone(), ColdSyncConfig::default()),
            Duration::from_secs(5),
        )),
    );

    let client = ReconciliationClient::new(peer("local"), dialer, ReconciliationConfig::default());

    let (diff_type, results) = client
        .head_ranges(&peer("remote"), &id, DiffType::Initial, vec![Range::new(0, u64::MAX, 20)])
        .await
        .expect("head sync");

    assert_eq!(diff_type, DiffType::Initial);
    assert_eq!(results, expected);
    assert_eq!(results[0].elements.len(), 10);

    let (diff_type, results) = client
        .head_ranges(&peer("remote"), &id, DiffType::Precalculated, vec![Range::WHOLE])
        .await
        .expect("head probe");

    assert_eq!(diff_type, DiffType::Precalculated);
    assert_eq!(results[0].hash, whole);
    assert_eq!(results[0].count, 10);
}
