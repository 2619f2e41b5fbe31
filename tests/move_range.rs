//! Range migration under live writes

mod common;

use common::*;
use rangeshift::coordinator::document::Outcome;
use rangeshift::coordinator::MoveRangeRequest;
use rangeshift::coordinator::metadata::RoutingStore;
use rangeshift::ops::verify_namespace;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_range_under_writes() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    let model = t.load_users(USERS, 0..200).await;

    let workload = Workload::spawn(t.cluster.router.clone(), USERS, model, 200, 7);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = t
        .service()
        .start_range_migration(MoveRangeRequest {
            namespace: USERS.into(),
            range: range(100, None),
            to_shard: "shard-b".into(),
        })
        .await
        .unwrap();
    let id = started.operation_id.unwrap();
    let outcome = t
        .service()
        .wait_for_completion(id, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Committed);

    let (model, writes) = workload.finish().await;
    assert!(writes > 0);

    let found = t.cluster.router.find_all(USERS).await.unwrap();
    assert_eq!(found, sorted(model.into_values()));

    let routing = t.cluster.routing.get_routing(USERS).unwrap().unwrap();
    assert_eq!(routing.epoch, 2);
    assert_eq!(routing.chunks.len(), 2);
    assert_eq!(routing.chunks[1].shard, "shard-b");
    assert_eq!(routing.chunks[1].range.min, uid(100));

    let report = verify_namespace(t.cluster.routing.as_ref(), &t.cluster.directory, USERS)
        .await
        .unwrap();
    assert!(report.is_consistent(), "{:?}", report);
    assert_eq!(t.guards_held(&id), 0);
}

#[tokio::test]
async fn test_move_back_merges_chunks() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    t.load_users(USERS, 0..40).await;

    for (min, to) in [(20, "shard-b"), (20, "shard-a")] {
        let id = t
            .service()
            .start_range_migration(MoveRangeRequest {
                namespace: USERS.into(),
                range: range(min, None),
                to_shard: to.into(),
            })
            .await
            .unwrap()
            .operation_id
            .unwrap();
        let outcome = t
            .service()
            .wait_for_completion(id, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Committed);
    }

    let routing = t.cluster.routing.get_routing(USERS).unwrap().unwrap();
    assert_eq!(routing.epoch, 3);
    assert_eq!(routing.chunks.len(), 1);
    assert_eq!(routing.chunks[0].shard, "shard-a");

    let raw = t.raw_counts(USERS);
    assert_eq!(raw["shard-a"], 40);
    assert_eq!(raw["shard-b"], 0);
}

#[tokio::test]
async fn test_range_spanning_owners_rejected() {
    let t = TestCluster::start(&["shard-a", "shard-b", "shard-c"]).await;
    t.shard_users(USERS).await;

    let id = t
        .service()
        .start_range_migration(MoveRangeRequest {
            namespace: USERS.into(),
            range: range(50, None),
            to_shard: "shard-b".into(),
        })
        .await
        .unwrap()
        .operation_id
        .unwrap();
    t.service()
        .wait_for_completion(id, Some(Duration::from_secs(30)))
        .await
        .unwrap();

    let err = t
        .service()
        .start_range_migration(MoveRangeRequest {
            namespace: USERS.into(),
            range: range(0, Some(100)),
            to_shard: "shard-c".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), rangeshift::common::ErrorKind::InvalidOptions);
}
