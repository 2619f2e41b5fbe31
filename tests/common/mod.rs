//! Shared harness for the migration tests
//!
//! Every test runs an in-process cluster. Shards can be wrapped in an
//! [`Interceptor`] that sits between the node and the directory, so tests
//! can script recipient lag, cut a shard off or re-deliver donor data.

#![allow(dead_code)]

use async_trait::async_trait;
use rangeshift::common::keys::{Document, KeyPattern, KeyRange, KeyValue, RangeBound, ShardKey};
use rangeshift::common::{CoordinatorConfig, MigrationConfig};
use rangeshift::coordinator::document::{
    OperationDocument, OperationId, OperationState, ParticipantDocument, Role, ShardId,
    SnapshotDescriptor,
};
use rangeshift::coordinator::metadata::{DocumentStore, MemoryMetadataStore, RoutingStore};
use rangeshift::coordinator::routing::CollectionRouting;
use rangeshift::coordinator::{CoordinatorService, ShardCollectionRequest};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rangeshift::shard::{
    ChangeBatch, CollectionOptions, DonorInstruction, FenceOutcome, RecipientInstruction,
    RecipientLag, Router, ShardClient, ShardNode, SnapshotBatch,
};
use rangeshift::{Error, LocalCluster, Result};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const USERS: &str = "app.users";

pub fn fast_coordinator() -> CoordinatorConfig {
    CoordinatorConfig {
        advance_interval_ms: 2,
        rpc_backoff_ms: 1,
        ..CoordinatorConfig::default()
    }
}

pub fn fast_migration() -> MigrationConfig {
    MigrationConfig {
        commit_poll_interval_ms: 2,
        recipient_tick_ms: 1,
        clone_batch_size: 64,
        apply_batch_size: 64,
        ..MigrationConfig::default()
    }
}

pub fn uid(i: i64) -> RangeBound {
    RangeBound::Key(ShardKey(vec![KeyValue::Int(i)]))
}

pub fn range(min: i64, max: Option<i64>) -> KeyRange {
    KeyRange::new(uid(min), max.map(uid).unwrap_or(RangeBound::Max)).unwrap()
}

pub fn user(i: i64) -> Document {
    const REGIONS: [&str; 3] = ["eu", "us", "ap"];
    json!({
        "_id": format!("u{}", i),
        "uid": i,
        "region": REGIONS[i as usize % REGIONS.len()],
        "n": 0,
    })
    .as_object()
    .cloned()
    .unwrap()
}

pub fn bumped(doc: &Document) -> Document {
    let mut next = doc.clone();
    let n = next["n"].as_i64().unwrap_or(0);
    next.insert("n".into(), json!(n + 1));
    next
}

/// Sorted by `_id`, the order `Router::find_all` returns
pub fn sorted(docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut docs: Vec<Document> = docs.into_iter().collect();
    docs.sort_by_cached_key(|d| d["_id"].as_str().unwrap_or_default().to_string());
    docs
}

/// Random inserts, updates and deletes through the router, recorded in a
/// model of what the collection must contain afterwards
pub struct Workload {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<(BTreeMap<String, Document>, usize)>,
}

impl Workload {
    pub fn spawn(
        router: Arc<Router>,
        namespace: &str,
        mut model: BTreeMap<String, Document>,
        mut next_uid: i64,
        seed: u64,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let namespace = namespace.to_string();
        let handle = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut writes = 0;
            while !flag.load(Ordering::SeqCst) {
                let existing = (!model.is_empty())
                    .then(|| model.keys().nth(rng.gen_range(0..model.len())).cloned())
                    .flatten();
                match (rng.gen_range(0..4), existing) {
                    (1 | 2, Some(id)) => {
                        let next = bumped(&model[&id]);
                        router.update(&namespace, next.clone()).await.unwrap();
                        model.insert(id, next);
                    }
                    (3, Some(id)) => {
                        router.delete(&namespace, &id).await.unwrap();
                        model.remove(&id);
                    }
                    _ => {
                        let doc = user(next_uid);
                        router.insert(&namespace, doc.clone()).await.unwrap();
                        model.insert(format!("u{}", next_uid), doc);
                        next_uid += 1;
                    }
                }
                writes += 1;
                tokio::task::yield_now().await;
            }
            (model, writes)
        });
        Self { stop, handle }
    }

    /// Stop writing; returns the model and the number of writes made
    pub async fn finish(self) -> (BTreeMap<String, Document>, usize) {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.await.unwrap()
    }
}

pub struct TestCluster {
    pub cluster: LocalCluster,
    pub store: Arc<MemoryMetadataStore>,
    pub interceptors: BTreeMap<ShardId, Arc<Interceptor>>,
}

impl TestCluster {
    pub async fn start(shards: &[&str]) -> Self {
        Self::start_with(shards, fast_coordinator(), fast_migration()).await
    }

    pub async fn start_with(
        shards: &[&str],
        coordinator: CoordinatorConfig,
        migration: MigrationConfig,
    ) -> Self {
        Self::start_in(shards, None, coordinator, migration).await
    }

    /// Shard data and snapshots live under `data_dir/<shard>`
    pub async fn start_in(
        shards: &[&str],
        data_dir: Option<&Path>,
        coordinator: CoordinatorConfig,
        migration: MigrationConfig,
    ) -> Self {
        let store = Arc::new(MemoryMetadataStore::new());
        let ids: Vec<String> = shards.iter().map(|s| s.to_string()).collect();
        let cluster = LocalCluster::assemble(
            store.clone(),
            store.clone(),
            &ids,
            data_dir.map(Path::to_path_buf),
            coordinator,
            migration,
        )
        .unwrap();

        let mut interceptors = BTreeMap::new();
        for node in &cluster.nodes {
            let interceptor = Arc::new(Interceptor::new(node.clone()));
            cluster.directory.register(interceptor.clone());
            interceptors.insert(node.id().to_string(), interceptor);
        }
        cluster.start().unwrap();

        Self {
            cluster,
            store,
            interceptors,
        }
    }

    pub fn service(&self) -> &Arc<CoordinatorService> {
        &self.cluster.service
    }

    pub fn shard(&self, id: &str) -> &Arc<Interceptor> {
        &self.interceptors[id]
    }

    pub fn node(&self, id: &str) -> &Arc<ShardNode> {
        self.cluster.node(id).unwrap()
    }

    /// Shard `namespace` on `uid`, everything on the first shard
    pub async fn shard_users(&self, namespace: &str) {
        self.service()
            .shard_collection(ShardCollectionRequest {
                namespace: namespace.into(),
                key_pattern: KeyPattern::parse("uid").unwrap(),
                chunks: None,
                options: CollectionOptions::default(),
            })
            .await
            .unwrap();
    }

    /// Insert `user(i)` for every `i` in `ids`, returning the model
    pub async fn load_users(&self, namespace: &str, ids: std::ops::Range<i64>) -> BTreeMap<String, Document> {
        let mut model = BTreeMap::new();
        for i in ids {
            let doc = user(i);
            self.cluster.router.insert(namespace, doc.clone()).await.unwrap();
            model.insert(format!("u{}", i), doc);
        }
        model
    }

    /// Poll until the operation reaches `state`
    pub async fn wait_for_state(&self, id: OperationId, state: OperationState, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let doc = self.service().get_operation(&id).unwrap();
            if doc.state == state {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "operation {} stuck in {} waiting for {}",
                id,
                doc.state,
                state
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Documents of `physical` on every shard, owned or not
    pub fn raw_counts(&self, physical: &str) -> BTreeMap<String, usize> {
        self.cluster
            .nodes
            .iter()
            .map(|n| (n.id().to_string(), n.raw_documents(physical).len()))
            .collect()
    }

    pub fn guards_held(&self, id: &OperationId) -> usize {
        self.cluster
            .nodes
            .iter()
            .map(|n| n.guard().held_by(id).len())
            .sum()
    }

    pub fn shutdown(&self) {
        self.cluster.shutdown();
    }
}

/// Wraps a shard node on the wire between it and everyone else
pub struct Interceptor {
    inner: Arc<ShardNode>,
    lag_script: Mutex<VecDeque<Duration>>,
    lag_fallback: Mutex<Option<Duration>>,
    lag_calls: AtomicUsize,
    frozen: AtomicBool,
    change_rewind: AtomicU64,
    replay_snapshot: AtomicBool,
    snapshot_calls: AtomicUsize,
    previous_after: Mutex<HashMap<OperationId, Option<String>>>,
    replays: AtomicUsize,
}

impl Interceptor {
    pub fn new(inner: Arc<ShardNode>) -> Self {
        Self {
            inner,
            lag_script: Mutex::new(VecDeque::new()),
            lag_fallback: Mutex::new(None),
            lag_calls: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            change_rewind: AtomicU64::new(0),
            replay_snapshot: AtomicBool::new(false),
            snapshot_calls: AtomicUsize::new(0),
            previous_after: Mutex::new(HashMap::new()),
            replays: AtomicUsize::new(0),
        }
    }

    /// Answer `report_lag` with `samples` (in ms) first, then with
    /// `then_ms`, or the real lag when `then_ms` is `None`
    pub fn script_lag(&self, samples: &[u64], then_ms: Option<u64>) {
        *self.lag_script.lock().unwrap() = samples.iter().map(|ms| Duration::from_millis(*ms)).collect();
        *self.lag_fallback.lock().unwrap() = then_ms.map(Duration::from_millis);
    }

    pub fn lag_calls(&self) -> usize {
        self.lag_calls.load(Ordering::SeqCst)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::SeqCst);
    }

    /// Serve every change-stream fetch from `seqs` entries earlier than asked
    pub fn rewind_changes(&self, seqs: u64) {
        self.change_rewind.store(seqs, Ordering::SeqCst);
    }

    /// Serve every other snapshot page twice
    pub fn replay_snapshot(&self) {
        self.replay_snapshot.store(true, Ordering::SeqCst);
    }

    /// Fetches that were answered with data already delivered
    pub fn replays(&self) -> usize {
        self.replays.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed(format!("{} is cut off", self.inner.id())));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardClient for Interceptor {
    fn shard_id(&self) -> &str {
        self.inner.id()
    }

    async fn ping(&self) -> Result<()> {
        self.gate()?;
        self.inner.ping().await
    }

    async fn prepare_to_donate(&self, instruction: DonorInstruction) -> Result<SnapshotDescriptor> {
        self.gate()?;
        self.inner.prepare_to_donate(instruction).await
    }

    async fn fetch_snapshot_batch(
        &self,
        operation_id: OperationId,
        after_id: Option<String>,
        limit: usize,
    ) -> Result<SnapshotBatch> {
        self.gate()?;
        let mut after = after_id.clone();
        if self.replay_snapshot.load(Ordering::SeqCst) {
            let mut previous = self.previous_after.lock().unwrap();
            let call = self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 1 && after.is_some() {
                if let Some(earlier) = previous.get(&operation_id) {
                    if *earlier != after {
                        after = earlier.clone();
                        self.replays.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            previous.insert(operation_id, after_id);
        }
        self.inner.fetch_snapshot_batch(operation_id, after, limit).await
    }

    async fn fetch_changes(
        &self,
        operation_id: OperationId,
        after_seq: u64,
        limit: usize,
    ) -> Result<ChangeBatch> {
        self.gate()?;
        let rewind = self.change_rewind.load(Ordering::SeqCst);
        let from = after_seq.saturating_sub(rewind);
        if from < after_seq {
            self.replays.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.fetch_changes(operation_id, from, limit).await
    }

    async fn enter_critical_section(&self, operation_id: OperationId, fence_token: u64) -> Result<u64> {
        self.gate()?;
        self.inner.enter_critical_section(operation_id, fence_token).await
    }

    async fn exit_critical_section(&self, operation_id: OperationId) -> Result<()> {
        self.gate()?;
        self.inner.exit_critical_section(operation_id).await
    }

    async fn fence_outcome(&self, fence_token: u64) -> Result<FenceOutcome> {
        self.gate()?;
        self.inner.fence_outcome(fence_token).await
    }

    async fn create_collection(&self, instruction: RecipientInstruction) -> Result<()> {
        self.gate()?;
        self.inner.create_collection(instruction).await
    }

    async fn clone_initial_data(
        &self,
        operation_id: OperationId,
        snapshots: Vec<SnapshotDescriptor>,
    ) -> Result<()> {
        self.gate()?;
        self.inner.clone_initial_data(operation_id, snapshots).await
    }

    async fn apply_change_stream(
        &self,
        operation_id: OperationId,
        fence_points: BTreeMap<ShardId, u64>,
    ) -> Result<()> {
        self.gate()?;
        self.inner.apply_change_stream(operation_id, fence_points).await
    }

    async fn report_lag(&self, operation_id: OperationId) -> Result<RecipientLag> {
        self.gate()?;
        self.lag_calls.fetch_add(1, Ordering::SeqCst);
        let mut lag = self.inner.report_lag(operation_id).await?;
        let scripted = self.lag_script.lock().unwrap().pop_front();
        if let Some(forced) = scripted.or(*self.lag_fallback.lock().unwrap()) {
            lag.lag = forced;
        }
        Ok(lag)
    }

    async fn report(&self, operation_id: OperationId, role: Role) -> Result<Option<ParticipantDocument>> {
        self.gate()?;
        self.inner.report(operation_id, role).await
    }

    async fn commit(&self, operation_id: OperationId, role: Role) -> Result<()> {
        self.gate()?;
        self.inner.commit(operation_id, role).await
    }

    async fn abort(&self, operation_id: OperationId, role: Role) -> Result<()> {
        self.gate()?;
        self.inner.abort(operation_id, role).await
    }

    async fn forget(&self, operation_id: OperationId, role: Role) -> Result<()> {
        self.gate()?;
        self.inner.forget(operation_id, role).await
    }

    async fn create_physical_collection(&self, physical: &str, options: CollectionOptions) -> Result<()> {
        self.gate()?;
        self.inner.create_physical_collection(physical, options).await
    }

    async fn insert(&self, namespace: &str, epoch: u64, doc: Document) -> Result<()> {
        self.gate()?;
        self.inner.insert(namespace, epoch, doc).await
    }

    async fn update(&self, namespace: &str, epoch: u64, doc: Document) -> Result<()> {
        self.gate()?;
        self.inner.update(namespace, epoch, doc).await
    }

    async fn delete(&self, namespace: &str, epoch: u64, id: &str) -> Result<bool> {
        self.gate()?;
        self.inner.delete(namespace, epoch, id).await
    }

    async fn find(&self, namespace: &str, epoch: u64) -> Result<Vec<Document>> {
        self.gate()?;
        self.inner.find(namespace, epoch).await
    }

    async fn get(&self, namespace: &str, epoch: u64, id: &str) -> Result<Option<Document>> {
        self.gate()?;
        self.inner.get(namespace, epoch, id).await
    }

    async fn sample_keys(
        &self,
        namespace: &str,
        epoch: u64,
        pattern: &KeyPattern,
        limit: usize,
    ) -> Result<Vec<ShardKey>> {
        self.gate()?;
        self.inner.sample_keys(namespace, epoch, pattern, limit).await
    }
}

/// Metadata store that goes away at a chosen point of the commit: before
/// the routing switch, or right after it, like a coordinator dying there
pub struct HaltingStore {
    inner: Arc<MemoryMetadataStore>,
    halt_routing_switch: AtomicBool,
    halt_after_commit: AtomicBool,
    rejected: AtomicUsize,
}

impl HaltingStore {
    pub fn before_routing_switch(inner: Arc<MemoryMetadataStore>) -> Self {
        Self {
            inner,
            halt_routing_switch: AtomicBool::new(true),
            halt_after_commit: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn after_commit(inner: Arc<MemoryMetadataStore>) -> Self {
        Self {
            inner,
            halt_routing_switch: AtomicBool::new(false),
            halt_after_commit: AtomicBool::new(true),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Let every later call through
    pub fn resume(&self) {
        self.halt_routing_switch.store(false, Ordering::SeqCst);
        self.halt_after_commit.store(false, Ordering::SeqCst);
    }

    fn reject(&self, what: &str) -> Error {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Error::ConnectionFailed(format!("metadata store went away during {}", what))
    }
}

impl DocumentStore for HaltingStore {
    fn put_operation(&self, doc: &OperationDocument) -> Result<()> {
        if self.halt_after_commit.load(Ordering::SeqCst)
            && matches!(doc.state, OperationState::Committed | OperationState::Done)
        {
            return Err(self.reject("operation update"));
        }
        self.inner.put_operation(doc)
    }

    fn get_operation(&self, id: &OperationId) -> Result<Option<OperationDocument>> {
        self.inner.get_operation(id)
    }

    fn list_operations(&self) -> Result<Vec<OperationDocument>> {
        self.inner.list_operations()
    }

    fn delete_operation(&self, id: &OperationId) -> Result<()> {
        self.inner.delete_operation(id)
    }

    fn put_participant(&self, doc: &ParticipantDocument) -> Result<()> {
        self.inner.put_participant(doc)
    }

    fn get_participant(&self, id: &OperationId, role: Role, shard: &str) -> Result<Option<ParticipantDocument>> {
        self.inner.get_participant(id, role, shard)
    }

    fn list_participants(&self) -> Result<Vec<ParticipantDocument>> {
        self.inner.list_participants()
    }

    fn delete_participant(&self, id: &OperationId, role: Role, shard: &str) -> Result<()> {
        self.inner.delete_participant(id, role, shard)
    }
}

impl RoutingStore for HaltingStore {
    fn get_routing(&self, namespace: &str) -> Result<Option<CollectionRouting>> {
        self.inner.get_routing(namespace)
    }

    fn list_routing(&self) -> Result<Vec<CollectionRouting>> {
        self.inner.list_routing()
    }

    fn compare_and_swap(
        &self,
        namespace: &str,
        expected_epoch: Option<u64>,
        next: &CollectionRouting,
    ) -> Result<()> {
        if self.halt_routing_switch.load(Ordering::SeqCst) && expected_epoch.is_some() {
            return Err(self.reject("routing switch"));
        }
        self.inner.compare_and_swap(namespace, expected_epoch, next)
    }

    fn next_fence_token(&self) -> Result<u64> {
        self.inner.next_fence_token()
    }
}
