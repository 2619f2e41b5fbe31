//! Resharding onto a new key while the collection takes writes

mod common;

use common::*;
use rangeshift::common::keys::{KeyPattern, KeyRange, KeyValue, RangeBound, ShardKey};
use rangeshift::common::{ErrorKind, MigrationConfig};
use rangeshift::coordinator::document::{OperationState, Outcome};
use rangeshift::coordinator::metadata::{DocumentStore, RoutingStore};
use rangeshift::coordinator::{Chunk, ReshardRequest};
use rangeshift::ops::verify_namespace;
use rangeshift::Error;
use serde_json::json;
use std::time::Duration;

#[cfg(feature = "heavy-tests")]
const DOCUMENTS: i64 = 10_000;
#[cfg(not(feature = "heavy-tests"))]
const DOCUMENTS: i64 = 2_000;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshard_under_writes() {
    let t = TestCluster::start(&["shard-a", "shard-b", "shard-c"]).await;
    t.shard_users(USERS).await;
    let model = t.load_users(USERS, 0..DOCUMENTS).await;

    let workload = Workload::spawn(t.cluster.router.clone(), USERS, model, DOCUMENTS, 42);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let id = t
        .service()
        .start_reshard(ReshardRequest {
            namespace: USERS.into(),
            new_key_pattern: KeyPattern::parse("region,uid").unwrap(),
            chunks: None,
            force_redistribution: false,
        })
        .await
        .unwrap()
        .operation_id
        .unwrap();
    let outcome = t
        .service()
        .wait_for_completion(id, Some(Duration::from_secs(120)))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Committed);

    let (model, writes) = workload.finish().await;
    assert!(writes > 0);
    let found = t.cluster.router.find_all(USERS).await.unwrap();
    assert_eq!(found.len(), model.len());
    assert_eq!(found, sorted(model.into_values()));

    let routing = t.cluster.routing.get_routing(USERS).unwrap().unwrap();
    assert_eq!(routing.epoch, 2);
    assert_eq!(routing.key_pattern, KeyPattern::parse("region,uid").unwrap());
    assert!(routing.physical.starts_with("app.__reshard_users_"));
    assert!(!t
        .node("shard-a")
        .physical_collections()
        .contains(&USERS.to_string()));

    let report = verify_namespace(t.cluster.routing.as_ref(), &t.cluster.directory, USERS)
        .await
        .unwrap();
    assert!(report.is_consistent(), "{:?}", report);
    assert!(report.per_shard.len() > 1);
}

#[tokio::test]
async fn test_reshard_with_explicit_chunks() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    t.load_users(USERS, 0..90).await;

    let split = RangeBound::Key(ShardKey(vec![KeyValue::Str("us".into()), KeyValue::Null]));
    let chunks = vec![
        Chunk::new(KeyRange::new(RangeBound::Min, split.clone()).unwrap(), "shard-a"),
        Chunk::new(KeyRange::new(split, RangeBound::Max).unwrap(), "shard-b"),
    ];
    let id = t
        .service()
        .start_reshard(ReshardRequest {
            namespace: USERS.into(),
            new_key_pattern: KeyPattern::parse("region,uid").unwrap(),
            chunks: Some(chunks),
            force_redistribution: false,
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

    let routing = t.cluster.routing.get_routing(USERS).unwrap().unwrap();
    let raw = t.raw_counts(&routing.physical);
    // user(i) cycles eu, us, ap
    assert_eq!(raw["shard-a"], 60);
    assert_eq!(raw["shard-b"], 30);
    for doc in t.node("shard-b").raw_documents(&routing.physical) {
        assert_eq!(doc["region"], "us");
    }
}

#[tokio::test]
async fn test_forced_reshard_on_same_key() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    let model = t.load_users(USERS, 0..100).await;

    let request = || ReshardRequest {
        namespace: USERS.into(),
        new_key_pattern: KeyPattern::parse("uid").unwrap(),
        chunks: None,
        force_redistribution: true,
    };
    let id = t.service().start_reshard(request()).await.unwrap().operation_id.unwrap();
    let outcome = t
        .service()
        .wait_for_completion(id, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Committed);

    let routing = t.cluster.routing.get_routing(USERS).unwrap().unwrap();
    assert_eq!(routing.epoch, 2);
    assert_ne!(routing.physical, USERS);
    let found = t.cluster.router.find_all(USERS).await.unwrap();
    assert_eq!(found, sorted(model.into_values()));
}

fn odd_score() -> rangeshift::common::keys::Document {
    json!({"_id": "odd", "uid": 500, "score": 1.5})
        .as_object()
        .cloned()
        .unwrap()
}

fn by_score(chunks: Option<Vec<Chunk>>) -> ReshardRequest {
    ReshardRequest {
        namespace: USERS.into(),
        new_key_pattern: KeyPattern::parse("score").unwrap(),
        chunks,
        force_redistribution: false,
    }
}

#[tokio::test]
async fn test_reshard_rejects_documents_without_new_key() {
    let t = TestCluster::start(&["shard-a", "shard-b"]).await;
    t.shard_users(USERS).await;
    t.load_users(USERS, 0..10).await;
    t.cluster.router.insert(USERS, odd_score()).await.unwrap();

    let split = RangeBound::Key(ShardKey(vec![KeyValue::Int(10)]));
    let explicit = vec![
        Chunk::new(KeyRange::new(RangeBound::Min, split.clone()).unwrap(), "shard-a"),
        Chunk::new(KeyRange::new(split, RangeBound::Max).unwrap(), "shard-b"),
    ];
    for chunks in [None, Some(explicit)] {
        let err = t.service().start_reshard(by_score(chunks)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidKeyPattern(_)), "{}", err);
        assert!(err.to_string().contains("odd"));
    }

    assert!(t.store.list_operations().unwrap().is_empty());
    assert_eq!(t.cluster.routing.get_routing(USERS).unwrap().unwrap().epoch, 1);
    assert_eq!(t.cluster.router.find_all(USERS).await.unwrap().len(), 11);
}

#[tokio::test]
async fn test_reshard_aborts_on_late_document_without_new_key() {
    // A zero threshold keeps the operation applying
    let migration = MigrationConfig {
        commit_lag_threshold_ms: 0,
        ..fast_migration()
    };
    let t = TestCluster::start_with(&["shard-a", "shard-b"], fast_coordinator(), migration).await;
    t.shard_users(USERS).await;
    t.load_users(USERS, 0..10).await;

    let id = t
        .service()
        .start_reshard(by_score(None))
        .await
        .unwrap()
        .operation_id
        .unwrap();
    t.wait_for_state(id, OperationState::Applying, Duration::from_secs(10))
        .await;
    // Valid under the current key, so the donor accepts it
    t.cluster.router.insert(USERS, odd_score()).await.unwrap();

    let outcome = t
        .service()
        .wait_for_completion(id, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    match outcome {
        Outcome::Aborted { reason } => {
            assert_eq!(reason.kind, ErrorKind::ParticipantFailed);
            assert!(reason.message.contains("odd"), "{}", reason.message);
        }
        Outcome::Committed => panic!("reshard committed without the odd document"),
    }

    let routing = t.cluster.routing.get_routing(USERS).unwrap().unwrap();
    assert_eq!(routing.epoch, 1);
    assert_eq!(routing.physical, USERS);
    let found = t.cluster.router.find_all(USERS).await.unwrap();
    assert_eq!(found.len(), 11);
    assert!(found.iter().any(|d| d["_id"] == "odd"));
}
