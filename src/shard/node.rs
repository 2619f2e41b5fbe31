//! Shard node
//!
//! Hosts one shard's physical collections, its critical section guard and
//! its donor/recipient participant documents, and answers every
//! [`ShardClient`] call. The donor and recipient handlers live in
//! `shard::donor` and `shard::recipient`.
//!
//! ## Write path
//!
//! A client write takes the storage lock, validates the caller's routing
//! epoch and ownership against the routing store, checks the guard and only
//! then appends to the collection. Because acquiring the guard also takes
//! the storage lock, every write either lands before the fence point
//! captured at acquisition or is rejected.
//!
//! Lock order: participant lock, storage lock, then the guard or the
//! routing store (never both at once).

use crate::common::config::MigrationConfig;
use crate::common::keys::{document_id, Document, KeyPattern, ShardKey};
use crate::common::timestamp_now_millis;
use crate::coordinator::document::{
    DonorState, OperationId, ParticipantBody, ParticipantDocument, RecipientState, Role, ShardId,
    SnapshotDescriptor,
};
use crate::coordinator::metadata::{DocumentStore, RoutingStore};
use crate::coordinator::routing::CollectionRouting;
use crate::shard::client::{
    ChangeBatch, DonorInstruction, RecipientInstruction, RecipientLag, ShardClient,
    ShardDirectory, SnapshotBatch,
};
use crate::shard::collection::{Collection, CollectionOptions};
use crate::shard::critical_section::{CriticalSectionGuard, FenceOutcome, GuardRecord};
use crate::shard::ddl::{DdlExecutor, LocalDdl};
use crate::shard::recipient::RecipientRuntime;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// Physical collections and donor snapshots of one shard
#[derive(Default)]
pub(super) struct Storage {
    pub(super) collections: HashMap<String, Collection>,
    pub(super) snapshots: HashMap<OperationId, Arc<Vec<Document>>>,
}

impl Storage {
    pub(super) fn collection(&self, physical: &str) -> Result<&Collection> {
        self.collections
            .get(physical)
            .ok_or_else(|| Error::NamespaceNotFound(physical.to_string()))
    }

    pub(super) fn collection_mut(&mut self, physical: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(physical)
            .ok_or_else(|| Error::NamespaceNotFound(physical.to_string()))
    }
}

/// Everything a node needs besides its collaborators
#[derive(Debug, Clone)]
pub struct ShardNodeOptions {
    pub shard_id: ShardId,
    pub migration: MigrationConfig,
    /// Persist collections and snapshots here; in-memory if unset
    pub data_dir: Option<PathBuf>,
}

impl ShardNodeOptions {
    pub fn new(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            migration: MigrationConfig::default(),
            data_dir: None,
        }
    }
}

pub struct ShardNode {
    pub(super) shard_id: ShardId,
    pub(super) config: MigrationConfig,
    data_dir: Option<PathBuf>,
    pub(super) routing: Arc<dyn RoutingStore>,
    documents: Arc<dyn DocumentStore>,
    pub(super) directory: Arc<ShardDirectory>,
    pub(super) ddl: Arc<dyn DdlExecutor>,
    storage: Mutex<Storage>,
    participant_lock: Mutex<()>,
    pub(super) guard: CriticalSectionGuard,
    recipients: Mutex<HashMap<OperationId, RecipientRuntime>>,
    self_ref: Weak<ShardNode>,
}

impl ShardNode {
    /// Open a node, reloading any collections persisted under `data_dir`.
    ///
    /// Call [`ShardNode::resume`] from inside a tokio runtime afterwards to
    /// re-attach to in-flight operations.
    pub fn open(
        options: ShardNodeOptions,
        routing: Arc<dyn RoutingStore>,
        documents: Arc<dyn DocumentStore>,
        directory: Arc<ShardDirectory>,
    ) -> Result<Arc<Self>> {
        Self::open_with_ddl(options, routing, documents, directory, Arc::new(LocalDdl))
    }

    pub fn open_with_ddl(
        options: ShardNodeOptions,
        routing: Arc<dyn RoutingStore>,
        documents: Arc<dyn DocumentStore>,
        directory: Arc<ShardDirectory>,
        ddl: Arc<dyn DdlExecutor>,
    ) -> Result<Arc<Self>> {
        options.migration.validate()?;

        let mut storage = Storage::default();
        if let Some(dir) = &options.data_dir {
            std::fs::create_dir_all(dir.join("snapshots"))?;
            for collection in Collection::discover(dir.join("collections"))? {
                storage
                    .collections
                    .insert(collection.name().to_string(), collection);
            }
        }

        tracing::info!(
            shard_id = %options.shard_id,
            collections = storage.collections.len(),
            persistent = options.data_dir.is_some(),
            "shard node opened"
        );

        Ok(Arc::new_cyclic(|self_ref| ShardNode {
            shard_id: options.shard_id,
            config: options.migration,
            data_dir: options.data_dir,
            routing,
            documents,
            directory,
            ddl,
            storage: Mutex::new(storage),
            participant_lock: Mutex::new(()),
            guard: CriticalSectionGuard::new(),
            recipients: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Re-attach to this shard's participant documents after a restart:
    /// reinstall held guards and restart recipient loops.
    pub fn resume(&self) -> Result<()> {
        let mut donors = 0;
        let mut recipients = 0;
        for doc in self.documents.list_participants()? {
            if doc.shard_id != self.shard_id {
                continue;
            }
            match &doc.body {
                ParticipantBody::Donor(donor) => {
                    if donor.state != DonorState::BlockingWrites {
                        continue;
                    }
                    let (Some(token), Some(final_seq)) = (donor.fence_token, donor.final_seq)
                    else {
                        continue;
                    };
                    for range in &donor.ranges {
                        self.guard.restore(GuardRecord {
                            operation_id: doc.operation_id,
                            namespace: doc.namespace.clone(),
                            range: range.clone(),
                            fence_token: token,
                            final_seq,
                            acquired_at: Instant::now(),
                        });
                    }
                    donors += 1;
                }
                ParticipantBody::Recipient(recipient) => {
                    if matches!(
                        recipient.state,
                        RecipientState::Cloning
                            | RecipientState::Applying
                            | RecipientState::StrictConsistency
                    ) {
                        self.ensure_recipient_task(doc.operation_id);
                        recipients += 1;
                    }
                }
            }
        }
        if donors + recipients > 0 {
            tracing::info!(
                shard_id = %self.shard_id,
                donors,
                recipients,
                "resumed in-flight participants"
            );
        }
        Ok(())
    }

    /// Stop every background recipient loop
    pub fn shutdown(&self) {
        let mut runtimes = self.runtimes();
        for (_, runtime) in runtimes.drain() {
            runtime.stop();
        }
    }

    pub fn id(&self) -> &str {
        &self.shard_id
    }

    pub fn guard(&self) -> &CriticalSectionGuard {
        &self.guard
    }

    pub(super) fn storage(&self) -> MutexGuard<'_, Storage> {
        self.storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn runtimes(&self) -> MutexGuard<'_, HashMap<OperationId, RecipientRuntime>> {
        self.recipients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn arc(&self) -> Option<Arc<ShardNode>> {
        self.self_ref.upgrade()
    }

    // === Participant documents ===

    pub(super) fn participant_guard(&self) -> MutexGuard<'_, ()> {
        self.participant_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn load(&self, op: &OperationId, role: Role) -> Result<Option<ParticipantDocument>> {
        self.documents.get_participant(op, role, &self.shard_id)
    }

    pub(super) fn save(&self, doc: &mut ParticipantDocument) -> Result<()> {
        doc.touch();
        self.documents.put_participant(doc)
    }

    /// Read-modify-write a participant document under the participant lock.
    ///
    /// The document is saved if `f` changed it, even when `f` fails.
    pub(super) fn modify_participant<R>(
        &self,
        op: &OperationId,
        role: Role,
        f: impl FnOnce(&mut ParticipantDocument) -> Result<R>,
    ) -> Result<R> {
        let _lock = self.participant_guard();
        let mut doc = self.load(op, role)?.ok_or_else(|| {
            Error::NotFound(format!("no {} document for {} on {}", role, op, self.shard_id))
        })?;
        let before = doc.clone();
        let out = f(&mut doc);
        if doc != before {
            self.save(&mut doc)?;
        }
        out
    }

    pub(super) fn new_participant(
        &self,
        operation_id: OperationId,
        namespace: &str,
        clone_timestamp: u64,
        body: ParticipantBody,
    ) -> ParticipantDocument {
        let now = timestamp_now_millis();
        ParticipantDocument {
            operation_id,
            shard_id: self.shard_id.clone(),
            namespace: namespace.to_string(),
            clone_timestamp,
            body,
            outcome: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(super) fn check_clone_timestamp(
        &self,
        doc: &ParticipantDocument,
        clone_timestamp: u64,
    ) -> Result<()> {
        if doc.clone_timestamp != clone_timestamp {
            return Err(Error::InvariantViolation(format!(
                "{} on {} was started at clone timestamp {}, asked to act at {}",
                doc.operation_id, self.shard_id, doc.clone_timestamp, clone_timestamp
            )));
        }
        Ok(())
    }

    pub(super) fn failed(&self, doc: &ParticipantDocument) -> Error {
        Error::ParticipantFailed {
            shard: self.shard_id.clone(),
            reason: doc
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "participant in error state".to_string()),
        }
    }

    // === Collections ===

    pub(super) fn create_collection_locked(
        &self,
        storage: &mut Storage,
        physical: &str,
        options: CollectionOptions,
    ) -> Result<()> {
        if storage.collections.contains_key(physical) {
            return Ok(());
        }
        let collection = match &self.data_dir {
            Some(dir) => Collection::open(dir.join("collections"), physical, options)?,
            None => Collection::in_memory(physical, options)?,
        };
        tracing::debug!(shard_id = %self.shard_id, physical, "collection created");
        storage.collections.insert(physical.to_string(), collection);
        Ok(())
    }

    pub(super) fn drop_collection_locked(&self, storage: &mut Storage, physical: &str) -> Result<()> {
        if let Some(collection) = storage.collections.remove(physical) {
            let documents = collection.len();
            collection.destroy()?;
            tracing::info!(shard_id = %self.shard_id, physical, documents, "collection dropped");
        }
        Ok(())
    }

    /// Names of the physical collections hosted here
    pub fn physical_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.storage().collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every document of a physical collection, owned or not
    pub fn raw_documents(&self, physical: &str) -> Vec<Document> {
        self.storage()
            .collections
            .get(physical)
            .map(|c| c.documents().cloned().collect())
            .unwrap_or_default()
    }

    // === Snapshots ===

    fn snapshot_path(&self, op: &OperationId) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join("snapshots").join(format!("{}.json", op)))
    }

    pub(super) fn store_snapshot(&self, op: OperationId, docs: Vec<Document>) -> Result<()> {
        if let Some(path) = self.snapshot_path(&op) {
            let bytes = serde_json::to_vec(&docs).map_err(|e| Error::Internal(e.to_string()))?;
            std::fs::write(path, bytes)?;
        }
        self.storage().snapshots.insert(op, Arc::new(docs));
        Ok(())
    }

    pub(super) fn load_snapshot(&self, op: &OperationId) -> Result<Arc<Vec<Document>>> {
        if let Some(snapshot) = self.storage().snapshots.get(op) {
            return Ok(snapshot.clone());
        }
        let missing = || Error::NotFound(format!("snapshot for {} on {}", op, self.shard_id));
        let path = self.snapshot_path(op).ok_or_else(missing)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
            Err(e) => return Err(e.into()),
        };
        let docs: Vec<Document> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Corrupted(format!("{}: {}", path.display(), e)))?;
        let snapshot = Arc::new(docs);
        self.storage().snapshots.insert(*op, snapshot.clone());
        Ok(snapshot)
    }

    pub(super) fn drop_snapshot(&self, op: &OperationId) -> Result<()> {
        self.storage().snapshots.remove(op);
        // A path that cannot be reached holds no snapshot
        if let Some(path) = self.snapshot_path(op).filter(|p| p.exists()) {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // === Data plane ===

    /// Routing as of `epoch`, or `StaleRoutingEpoch` if it has moved on
    fn routing_at(&self, namespace: &str, epoch: u64) -> Result<CollectionRouting> {
        let routing = self
            .routing
            .get_routing(namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        if routing.epoch != epoch {
            return Err(Error::StaleRoutingEpoch {
                namespace: namespace.to_string(),
                expected: epoch,
                actual: routing.epoch,
            });
        }
        Ok(routing)
    }

    fn authorize_write(&self, routing: &CollectionRouting, key: &ShardKey) -> Result<()> {
        if !routing.owns(&self.shard_id, key) {
            return Err(Error::StaleRoute {
                namespace: routing.namespace.clone(),
                shard: self.shard_id.clone(),
            });
        }
        self.guard.check_write(&routing.namespace, key)
    }

    fn owned(&self, routing: &CollectionRouting, doc: &Document) -> bool {
        routing
            .key_pattern
            .extract(doc)
            .map(|key| routing.owns(&self.shard_id, &key))
            .unwrap_or(false)
    }
}

/// Evenly spaced picks from a sorted sample population
fn spread<T: Clone>(sorted: &[T], limit: usize) -> Vec<T> {
    if limit == 0 || sorted.is_empty() {
        return Vec::new();
    }
    if sorted.len() <= limit {
        return sorted.to_vec();
    }
    (0..limit)
        .map(|i| sorted[i * sorted.len() / limit].clone())
        .collect()
}

#[async_trait]
impl ShardClient for ShardNode {
    fn shard_id(&self) -> &str {
        &self.shard_id
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn prepare_to_donate(&self, instruction: DonorInstruction) -> Result<SnapshotDescriptor> {
        self.donor_prepare(instruction)
    }

    async fn fetch_snapshot_batch(
        &self,
        operation_id: OperationId,
        after_id: Option<String>,
        limit: usize,
    ) -> Result<SnapshotBatch> {
        self.donor_snapshot_batch(&operation_id, after_id.as_deref(), limit)
    }

    async fn fetch_changes(
        &self,
        operation_id: OperationId,
        after_seq: u64,
        limit: usize,
    ) -> Result<ChangeBatch> {
        self.donor_changes(&operation_id, after_seq, limit)
    }

    async fn enter_critical_section(
        &self,
        operation_id: OperationId,
        fence_token: u64,
    ) -> Result<u64> {
        self.donor_enter_critical_section(operation_id, fence_token)
    }

    async fn exit_critical_section(&self, operation_id: OperationId) -> Result<()> {
        self.donor_exit_critical_section(&operation_id)
    }

    async fn fence_outcome(&self, fence_token: u64) -> Result<FenceOutcome> {
        Ok(self.guard.outcome(fence_token))
    }

    async fn create_collection(&self, instruction: RecipientInstruction) -> Result<()> {
        self.recipient_create_collection(instruction)
    }

    async fn clone_initial_data(
        &self,
        operation_id: OperationId,
        snapshots: Vec<SnapshotDescriptor>,
    ) -> Result<()> {
        self.recipient_clone(operation_id, &snapshots)
    }

    async fn apply_change_stream(
        &self,
        operation_id: OperationId,
        fence_points: BTreeMap<ShardId, u64>,
    ) -> Result<()> {
        self.recipient_apply_to_fence(operation_id, &fence_points)
    }

    async fn report_lag(&self, operation_id: OperationId) -> Result<RecipientLag> {
        self.recipient_lag(&operation_id)
    }

    async fn report(
        &self,
        operation_id: OperationId,
        role: Role,
    ) -> Result<Option<ParticipantDocument>> {
        self.load(&operation_id, role)
    }

    async fn commit(&self, operation_id: OperationId, role: Role) -> Result<()> {
        match role {
            Role::Donor => self.donor_commit(&operation_id),
            Role::Recipient => self.recipient_commit(&operation_id),
        }
    }

    async fn abort(&self, operation_id: OperationId, role: Role) -> Result<()> {
        match role {
            Role::Donor => self.donor_abort(&operation_id),
            Role::Recipient => self.recipient_abort(&operation_id),
        }
    }

    async fn forget(&self, operation_id: OperationId, role: Role) -> Result<()> {
        match role {
            Role::Donor => {
                self.drop_snapshot(&operation_id)?;
                self.guard.forget(&operation_id);
            }
            Role::Recipient => self.stop_recipient_task(&operation_id),
        }
        let _lock = self.participant_guard();
        self.documents
            .delete_participant(&operation_id, role, &self.shard_id)
    }

    async fn create_physical_collection(
        &self,
        physical: &str,
        options: CollectionOptions,
    ) -> Result<()> {
        let mut storage = self.storage();
        self.create_collection_locked(&mut storage, physical, options)
    }

    async fn insert(&self, namespace: &str, epoch: u64, doc: Document) -> Result<()> {
        let mut storage = self.storage();
        let routing = self.routing_at(namespace, epoch)?;
        let key = routing.key_pattern.extract(&doc)?;
        self.authorize_write(&routing, &key)?;
        storage.collection_mut(&routing.physical)?.insert(doc)?;
        Ok(())
    }

    async fn update(&self, namespace: &str, epoch: u64, doc: Document) -> Result<()> {
        let mut storage = self.storage();
        let routing = self.routing_at(namespace, epoch)?;
        let key = routing.key_pattern.extract(&doc)?;
        self.authorize_write(&routing, &key)?;

        let collection = storage.collection_mut(&routing.physical)?;
        let id = document_id(&doc)?;
        let existing = collection
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("{} in {}", id, namespace)))?;
        if routing.key_pattern.extract(existing)? != key {
            return Err(Error::InvalidDocument(format!(
                "update of {} would change its shard key ({})",
                id, routing.key_pattern
            )));
        }
        collection.replace(doc)?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, epoch: u64, id: &str) -> Result<bool> {
        let mut storage = self.storage();
        let routing = self.routing_at(namespace, epoch)?;
        let collection = storage.collection_mut(&routing.physical)?;
        let Some(existing) = collection.get(id) else {
            return Ok(false);
        };
        let key = routing.key_pattern.extract(existing)?;
        if !routing.owns(&self.shard_id, &key) {
            // Orphan left behind by a migration; not ours to delete
            return Ok(false);
        }
        self.guard.check_write(namespace, &key)?;
        Ok(collection.remove(id)?.is_some())
    }

    async fn find(&self, namespace: &str, epoch: u64) -> Result<Vec<Document>> {
        let storage = self.storage();
        let routing = self.routing_at(namespace, epoch)?;
        let collection = storage.collection(&routing.physical)?;
        Ok(collection
            .documents()
            .filter(|doc| self.owned(&routing, doc))
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, epoch: u64, id: &str) -> Result<Option<Document>> {
        let storage = self.storage();
        let routing = self.routing_at(namespace, epoch)?;
        let collection = storage.collection(&routing.physical)?;
        Ok(collection
            .get(id)
            .filter(|doc| self.owned(&routing, doc))
            .cloned())
    }

    async fn sample_keys(
        &self,
        namespace: &str,
        epoch: u64,
        pattern: &KeyPattern,
        limit: usize,
    ) -> Result<Vec<ShardKey>> {
        let storage = self.storage();
        let routing = self.routing_at(namespace, epoch)?;
        let collection = storage.collection(&routing.physical)?;
        let mut keys: Vec<ShardKey> = Vec::new();
        for doc in collection.documents().filter(|doc| self.owned(&routing, doc)) {
            let key = pattern.extract(doc).map_err(|e| {
                Error::InvalidKeyPattern(format!(
                    "document {} on {} has no valid {} key: {}",
                    document_id(doc).unwrap_or_else(|_| "<no _id>".into()),
                    self.shard_id,
                    pattern,
                    e
                ))
            })?;
            keys.push(key);
        }
        keys.sort();
        keys.dedup();
        Ok(spread(&keys, limit))
    }
}
