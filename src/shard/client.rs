//! Participant RPC surface
//!
//! Everything the coordinator, other shards and the router say to a shard
//! goes through [`ShardClient`]. Every handler is idempotent, since the
//! channel is at-least-once. [`ShardDirectory`] resolves shard ids to
//! clients; an unknown shard is reported as unreachable.

use crate::common::keys::{Document, KeyPattern, KeyRange, ShardKey};
use crate::coordinator::document::{
    OperationId, OperationType, ParticipantDocument, Role, ShardId, SnapshotDescriptor,
};
use crate::shard::change_log::Mutation;
use crate::shard::collection::CollectionOptions;
use crate::shard::critical_section::FenceOutcome;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Sent to each donor during `Initializing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorInstruction {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub namespace: String,
    pub clone_timestamp: u64,
    pub source_physical: String,
    pub source_key_pattern: KeyPattern,
    /// Source-key ranges this donor hands over
    pub ranges: Vec<KeyRange>,
}

/// Sent to each recipient during `Initializing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientInstruction {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub namespace: String,
    pub clone_timestamp: u64,
    pub destination_physical: String,
    pub destination_key_pattern: KeyPattern,
    /// Destination-key ranges this recipient will own
    pub ranges: Vec<KeyRange>,
    pub donors: BTreeSet<ShardId>,
    pub options: CollectionOptions,
}

/// A page of the donor's initial-copy snapshot, in `_id` order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBatch {
    pub documents: Vec<Document>,
    pub done: bool,
}

/// A page of the donor's change stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Mutations touching the donated ranges, in donor order
    pub mutations: Vec<Mutation>,
    /// Every sequence number up to here has been examined
    pub scanned_through: u64,
    /// Donor's newest sequence number
    pub latest_seq: u64,
    /// Write time of the oldest mutation not yet returned, if any
    pub oldest_pending_at: Option<u64>,
}

/// Recipient apply lag, as reported to the commit monitor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientLag {
    pub shard_id: ShardId,
    /// Age of the oldest donor mutation not yet applied
    pub lag: Duration,
    /// Donor mutations not yet examined, summed over donors
    pub pending: u64,
    pub last_applied: BTreeMap<ShardId, u64>,
}

#[async_trait]
pub trait ShardClient: Send + Sync {
    fn shard_id(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    // === Donor ===

    /// Take the snapshot and start the change stream in one atomic step
    async fn prepare_to_donate(&self, instruction: DonorInstruction) -> Result<SnapshotDescriptor>;

    async fn fetch_snapshot_batch(
        &self,
        operation_id: OperationId,
        after_id: Option<String>,
        limit: usize,
    ) -> Result<SnapshotBatch>;

    async fn fetch_changes(
        &self,
        operation_id: OperationId,
        after_seq: u64,
        limit: usize,
    ) -> Result<ChangeBatch>;

    /// Block writes to the donated ranges; returns the final sequence number
    async fn enter_critical_section(&self, operation_id: OperationId, fence_token: u64)
        -> Result<u64>;

    /// Release without committing. No-op if never entered.
    async fn exit_critical_section(&self, operation_id: OperationId) -> Result<()>;

    async fn fence_outcome(&self, fence_token: u64) -> Result<FenceOutcome>;

    // === Recipient ===

    async fn create_collection(&self, instruction: RecipientInstruction) -> Result<()>;

    async fn clone_initial_data(
        &self,
        operation_id: OperationId,
        snapshots: Vec<SnapshotDescriptor>,
    ) -> Result<()>;

    /// Record the donors' fence points; the recipient applies up to them
    async fn apply_change_stream(
        &self,
        operation_id: OperationId,
        fence_points: BTreeMap<ShardId, u64>,
    ) -> Result<()>;

    async fn report_lag(&self, operation_id: OperationId) -> Result<RecipientLag>;

    // === Both roles ===

    async fn report(&self, operation_id: OperationId, role: Role)
        -> Result<Option<ParticipantDocument>>;

    async fn commit(&self, operation_id: OperationId, role: Role) -> Result<()>;

    async fn abort(&self, operation_id: OperationId, role: Role) -> Result<()>;

    /// Delete the participant document
    async fn forget(&self, operation_id: OperationId, role: Role) -> Result<()>;

    // === Data plane ===

    async fn create_physical_collection(
        &self,
        physical: &str,
        options: CollectionOptions,
    ) -> Result<()>;

    async fn insert(&self, namespace: &str, epoch: u64, doc: Document) -> Result<()>;

    async fn update(&self, namespace: &str, epoch: u64, doc: Document) -> Result<()>;

    async fn delete(&self, namespace: &str, epoch: u64, id: &str) -> Result<bool>;

    /// Owned documents only; orphans are filtered out
    async fn find(&self, namespace: &str, epoch: u64) -> Result<Vec<Document>>;

    async fn get(&self, namespace: &str, epoch: u64, id: &str) -> Result<Option<Document>>;

    /// Sample of `pattern` keys over this shard's owned documents
    async fn sample_keys(
        &self,
        namespace: &str,
        epoch: u64,
        pattern: &KeyPattern,
        limit: usize,
    ) -> Result<Vec<ShardKey>>;
}

/// Shard id to client resolution
#[derive(Default)]
pub struct ShardDirectory {
    clients: RwLock<BTreeMap<ShardId, Arc<dyn ShardClient>>>,
}

impl ShardDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a shard's client
    pub fn register(&self, client: Arc<dyn ShardClient>) {
        let id = client.shard_id().to_string();
        self.clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, client);
    }

    pub fn deregister(&self, shard_id: &str) -> Option<Arc<dyn ShardClient>> {
        self.clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(shard_id)
    }

    pub fn get(&self, shard_id: &str) -> Result<Arc<dyn ShardClient>> {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(shard_id)
            .cloned()
            .ok_or_else(|| Error::ParticipantUnreachable(shard_id.to_string()))
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(shard_id)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
