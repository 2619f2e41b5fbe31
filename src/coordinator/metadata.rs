//! Participant state store and routing store
//!
//! Stores:
//! - Operation documents (owned by the coordinator)
//! - Participant documents (owned by each shard)
//! - Routing tables, swapped only by epoch compare-and-swap
//! - The fence token counter
//!
//! Two backends: RocksDB (column families, bincode values) and an in-memory
//! map used by tests and ephemeral clusters.

use crate::coordinator::document::{
    OperationDocument, OperationId, ParticipantDocument, Role,
};
use crate::coordinator::routing::CollectionRouting;
use crate::{Error, Result};
use rocksdb::{ColumnFamily, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

const CF_OPERATIONS: &str = "operations";
const CF_PARTICIPANTS: &str = "participants";
const CF_ROUTING: &str = "routing";
const CF_CONFIG: &str = "config";

const FENCE_TOKEN_KEY: &str = "fence_token";

/// Durable operation and participant documents
pub trait DocumentStore: Send + Sync {
    fn put_operation(&self, doc: &OperationDocument) -> Result<()>;
    fn get_operation(&self, id: &OperationId) -> Result<Option<OperationDocument>>;
    fn list_operations(&self) -> Result<Vec<OperationDocument>>;
    fn delete_operation(&self, id: &OperationId) -> Result<()>;

    fn put_participant(&self, doc: &ParticipantDocument) -> Result<()>;
    fn get_participant(
        &self,
        id: &OperationId,
        role: Role,
        shard: &str,
    ) -> Result<Option<ParticipantDocument>>;
    fn list_participants(&self) -> Result<Vec<ParticipantDocument>>;
    fn delete_participant(&self, id: &OperationId, role: Role, shard: &str) -> Result<()>;
}

/// Linearizable routing metadata
pub trait RoutingStore: Send + Sync {
    fn get_routing(&self, namespace: &str) -> Result<Option<CollectionRouting>>;
    fn list_routing(&self) -> Result<Vec<CollectionRouting>>;

    /// Install `next` only if the current epoch equals `expected_epoch`
    /// (`None` meaning "no table yet"). Fails with `StaleRoutingEpoch`.
    fn compare_and_swap(
        &self,
        namespace: &str,
        expected_epoch: Option<u64>,
        next: &CollectionRouting,
    ) -> Result<()>;

    /// Monotonically increasing across restarts
    fn next_fence_token(&self) -> Result<u64>;
}

fn participant_key(id: &OperationId, role: Role, shard: &str) -> String {
    format!("{}/{}/{}", id, role, shard)
}

fn stale_epoch(namespace: &str, expected: Option<u64>, actual: Option<u64>) -> Error {
    Error::StaleRoutingEpoch {
        namespace: namespace.to_string(),
        expected: expected.unwrap_or(0),
        actual: actual.unwrap_or(0),
    }
}

/// RocksDB-backed store
pub struct RocksMetadataStore {
    db: DB,
    /// Serializes read-compare-write sequences
    cas_lock: Mutex<()>,
}

impl RocksMetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_OPERATIONS, CF_PARTICIPANTS, CF_ROUTING, CF_CONFIG],
        )?;

        Ok(Self {
            db,
            cas_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    fn put<T: serde::Serialize>(&self, cf: &str, key: &str, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(self.cf(cf)?, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list<T: serde::de::DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, rocksdb::IteratorMode::Start);
        let mut out = Vec::new();
        for item in iter {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.cas_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl DocumentStore for RocksMetadataStore {
    fn put_operation(&self, doc: &OperationDocument) -> Result<()> {
        self.put(CF_OPERATIONS, &doc.operation_id.to_string(), doc)
    }

    fn get_operation(&self, id: &OperationId) -> Result<Option<OperationDocument>> {
        self.get(CF_OPERATIONS, &id.to_string())
    }

    fn list_operations(&self) -> Result<Vec<OperationDocument>> {
        self.list(CF_OPERATIONS)
    }

    fn delete_operation(&self, id: &OperationId) -> Result<()> {
        self.db
            .delete_cf(self.cf(CF_OPERATIONS)?, id.to_string().as_bytes())?;
        Ok(())
    }

    fn put_participant(&self, doc: &ParticipantDocument) -> Result<()> {
        let key = participant_key(&doc.operation_id, doc.role(), &doc.shard_id);
        self.put(CF_PARTICIPANTS, &key, doc)
    }

    fn get_participant(
        &self,
        id: &OperationId,
        role: Role,
        shard: &str,
    ) -> Result<Option<ParticipantDocument>> {
        self.get(CF_PARTICIPANTS, &participant_key(id, role, shard))
    }

    fn list_participants(&self) -> Result<Vec<ParticipantDocument>> {
        self.list(CF_PARTICIPANTS)
    }

    fn delete_participant(&self, id: &OperationId, role: Role, shard: &str) -> Result<()> {
        self.db.delete_cf(
            self.cf(CF_PARTICIPANTS)?,
            participant_key(id, role, shard).as_bytes(),
        )?;
        Ok(())
    }
}

impl RoutingStore for RocksMetadataStore {
    fn get_routing(&self, namespace: &str) -> Result<Option<CollectionRouting>> {
        self.get(CF_ROUTING, namespace)
    }

    fn list_routing(&self) -> Result<Vec<CollectionRouting>> {
        self.list(CF_ROUTING)
    }

    fn compare_and_swap(
        &self,
        namespace: &str,
        expected_epoch: Option<u64>,
        next: &CollectionRouting,
    ) -> Result<()> {
        let _guard = self.lock();
        let current: Option<CollectionRouting> = self.get(CF_ROUTING, namespace)?;
        let actual = current.map(|r| r.epoch);
        if actual != expected_epoch {
            return Err(stale_epoch(namespace, expected_epoch, actual));
        }
        self.put(CF_ROUTING, namespace, next)?;
        // Routing switches must survive a crash right after the CAS returns
        self.db.flush_cf(self.cf(CF_ROUTING)?)?;
        Ok(())
    }

    fn next_fence_token(&self) -> Result<u64> {
        let _guard = self.lock();
        let current: u64 = self.get(CF_CONFIG, FENCE_TOKEN_KEY)?.unwrap_or(0);
        let next = current + 1;
        self.put(CF_CONFIG, FENCE_TOKEN_KEY, &next)?;
        Ok(next)
    }
}

#[derive(Default)]
struct MemoryState {
    operations: BTreeMap<String, OperationDocument>,
    participants: BTreeMap<String, ParticipantDocument>,
    routing: BTreeMap<String, CollectionRouting>,
    fence_token: u64,
}

/// In-memory store; a single mutex makes every call linearizable
#[derive(Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MemoryState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DocumentStore for MemoryMetadataStore {
    fn put_operation(&self, doc: &OperationDocument) -> Result<()> {
        self.state()
            .operations
            .insert(doc.operation_id.to_string(), doc.clone());
        Ok(())
    }

    fn get_operation(&self, id: &OperationId) -> Result<Option<OperationDocument>> {
        Ok(self.state().operations.get(&id.to_string()).cloned())
    }

    fn list_operations(&self) -> Result<Vec<OperationDocument>> {
        Ok(self.state().operations.values().cloned().collect())
    }

    fn delete_operation(&self, id: &OperationId) -> Result<()> {
        self.state().operations.remove(&id.to_string());
        Ok(())
    }

    fn put_participant(&self, doc: &ParticipantDocument) -> Result<()> {
        let key = participant_key(&doc.operation_id, doc.role(), &doc.shard_id);
        self.state().participants.insert(key, doc.clone());
        Ok(())
    }

    fn get_participant(
        &self,
        id: &OperationId,
        role: Role,
        shard: &str,
    ) -> Result<Option<ParticipantDocument>> {
        Ok(self
            .state()
            .participants
            .get(&participant_key(id, role, shard))
            .cloned())
    }

    fn list_participants(&self) -> Result<Vec<ParticipantDocument>> {
        Ok(self.state().participants.values().cloned().collect())
    }

    fn delete_participant(&self, id: &OperationId, role: Role, shard: &str) -> Result<()> {
        self.state()
            .participants
            .remove(&participant_key(id, role, shard));
        Ok(())
    }
}

impl RoutingStore for MemoryMetadataStore {
    fn get_routing(&self, namespace: &str) -> Result<Option<CollectionRouting>> {
        Ok(self.state().routing.get(namespace).cloned())
    }

    fn list_routing(&self) -> Result<Vec<CollectionRouting>> {
        Ok(self.state().routing.values().cloned().collect())
    }

    fn compare_and_swap(
        &self,
        namespace: &str,
        expected_epoch: Option<u64>,
        next: &CollectionRouting,
    ) -> Result<()> {
        let mut state = self.state();
        let actual = state.routing.get(namespace).map(|r| r.epoch);
        if actual != expected_epoch {
            return Err(stale_epoch(namespace, expected_epoch, actual));
        }
        state.routing.insert(namespace.to_string(), next.clone());
        Ok(())
    }

    fn next_fence_token(&self) -> Result<u64> {
        let mut state = self.state();
        state.fence_token += 1;
        Ok(state.fence_token)
    }
}
