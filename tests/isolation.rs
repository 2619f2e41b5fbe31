//! Operations on different collections do not interfere

mod common;

use common::*;
use rangeshift::common::ErrorKind;
use rangeshift::coordinator::document::{OperationId, OperationState, Outcome};
use rangeshift::coordinator::metadata::RoutingStore;
use rangeshift::coordinator::MoveRangeRequest;
use rangeshift::shard::ShardClient;
use rangeshift::Error;
use std::time::Duration;

const ORDERS: &str = "app.orders";

fn move_from(namespace: &str, min: i64) -> MoveRangeRequest {
    MoveRangeRequest {
        namespace: namespace.into(),
        range: range(min, None),
        to_shard: "shard-b".into(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_on_two_collections() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    t.shard_users(ORDERS).await;
    let users = t.load_users(USERS, 0..100).await;
    let orders = t.load_users(ORDERS, 0..100).await;

    let a = t.service().start_range_migration(move_from(USERS, 50)).await.unwrap();
    let b = t.service().start_range_migration(move_from(ORDERS, 20)).await.unwrap();
    let (a, b) = (a.operation_id.unwrap(), b.operation_id.unwrap());

    let timeout = Some(Duration::from_secs(30));
    let (oa, ob) = tokio::join!(
        t.service().wait_for_completion(a, timeout),
        t.service().wait_for_completion(b, timeout),
    );
    assert_eq!(oa.unwrap(), Outcome::Committed);
    assert_eq!(ob.unwrap(), Outcome::Committed);

    for (namespace, split) in [(USERS, 50), (ORDERS, 20)] {
        let routing = t.cluster.routing.get_routing(namespace).unwrap().unwrap();
        assert_eq!(routing.epoch, 2);
        assert_eq!(routing.chunks[1].range.min, uid(split));
        assert_eq!(t.raw_counts(namespace)["shard-b"], 100 - split as usize);
    }
    assert_eq!(t.cluster.router.find_all(USERS).await.unwrap(), sorted(users.into_values()));
    assert_eq!(t.cluster.router.find_all(ORDERS).await.unwrap(), sorted(orders.into_values()));
}

#[tokio::test]
async fn test_second_operation_on_namespace_conflicts() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    t.load_users(USERS, 0..40).await;
    t.shard("shard-b").script_lag(&[5], Some(500));

    let first = t
        .service()
        .start_range_migration(move_from(USERS, 20))
        .await
        .unwrap()
        .operation_id
        .unwrap();
    t.wait_for_state(first, OperationState::MonitoringCommit, Duration::from_secs(10))
        .await;

    let err = t
        .service()
        .start_range_migration(move_from(USERS, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConflictingOperation { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidOptions);

    let aborted = t
        .service()
        .request_abort_namespace(USERS, "make room")
        .await
        .unwrap();
    assert_eq!(aborted, first);
    t.service()
        .wait_for_completion(first, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    t.wait_for_state(first, OperationState::Done, Duration::from_secs(10))
        .await;

    t.shard("shard-b").script_lag(&[], None);
    let second = t
        .service()
        .start_range_migration(move_from(USERS, 30))
        .await
        .unwrap()
        .operation_id
        .unwrap();
    let outcome = t
        .service()
        .wait_for_completion(second, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Committed);
}

#[tokio::test]
async fn test_fence_blocks_only_its_range() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    t.shard_users(ORDERS).await;

    let holder = OperationId::generate();
    let token = t.cluster.routing.next_fence_token().unwrap();
    t.node("shard-a")
        .guard()
        .try_acquire(USERS, &range(50, None), holder, token, 0)
        .unwrap();

    let shard = t.shard("shard-a");
    shard.insert(USERS, 1, user(10)).await.unwrap();
    shard.insert(ORDERS, 1, user(60)).await.unwrap();
    let err = shard.insert(USERS, 1, user(60)).await.unwrap_err();
    assert!(matches!(err, Error::MigrationInProgress { .. }));

    t.node("shard-a").guard().release(&holder, false);
    shard.insert(USERS, 1, user(60)).await.unwrap();
}
