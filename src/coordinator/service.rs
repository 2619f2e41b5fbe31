//! The coordinator
//!
//! Owns every [`OperationDocument`], sequences donors and recipients
//! through their state machines and decides commit versus abort.
//!
//! ## Advance
//!
//! [`CoordinatorService::advance`] is one pass over one operation: load the
//! persisted document, look at participant reports, perform the side
//! effects of the current state and persist the next state. Every side
//! effect is an idempotent participant call, so a pass can be repeated or
//! resumed after a crash from nothing but the persisted documents. A
//! background runner per operation calls `advance` until `Done`.
//!
//! Passes of one operation are serialized by a per-operation lock. An abort
//! request takes the same lock, so it either lands before `Committing` is
//! persisted or is rejected.
//!
//! ## Failures
//!
//! Participant RPCs are retried with backoff. A transient failure leaves the
//! state untouched and the pass is retried later. A fatal participant error,
//! an invariant violation, or a participant unreachable for longer than the
//! participant timeout moves the operation to `Aborting`, but only before
//! `Committing`. From `Committing` on everything is retried forever.

use crate::common::config::{CoordinatorConfig, MigrationConfig};
use crate::common::keys::{KeyPattern, KeyRange, ShardKey};
use crate::common::metrics::METRICS;
use crate::common::utils::{retry_with_backoff, validate_namespace};
use crate::common::{timestamp_now_millis, ErrorKind, OperationError};
use crate::coordinator::commit_monitor::{
    CommitMonitor, CommitReadiness, LagSource, MonitorOutcome,
};
use crate::coordinator::critical_section::{acquire_all, release_all, ReleasePolicy};
use crate::coordinator::document::{
    OperationDocument, OperationId, OperationState, OperationType, Outcome, ParticipantDocument,
    Role, ShardId, SnapshotDescriptor,
};
use crate::coordinator::metadata::{DocumentStore, RoutingStore};
use crate::coordinator::routing::{chunks_from_split_points, validate_chunks, Chunk, CollectionRouting};
use crate::shard::client::{DonorInstruction, RecipientInstruction, ShardClient, ShardDirectory};
use crate::shard::collection::CollectionOptions;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Keys sampled per shard when a reshard request carries no chunks
const SAMPLES_PER_SHARD: usize = 256;

#[derive(Debug, Clone)]
pub struct MoveRangeRequest {
    pub namespace: String,
    pub range: KeyRange,
    pub to_shard: ShardId,
}

#[derive(Debug, Clone)]
pub struct ReshardRequest {
    pub namespace: String,
    pub new_key_pattern: KeyPattern,
    /// Destination layout; sampled from the data when absent
    pub chunks: Option<Vec<Chunk>>,
    /// Reshard even when the key pattern does not change
    pub force_redistribution: bool,
}

#[derive(Debug, Clone)]
pub struct ShardCollectionRequest {
    pub namespace: String,
    pub key_pattern: KeyPattern,
    /// Initial layout; everything on the first shard when absent
    pub chunks: Option<Vec<Chunk>>,
    pub options: CollectionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResponse {
    pub ok: bool,
    pub operation_id: Option<OperationId>,
    /// The request was redundant and nothing was started
    pub noop: bool,
}

impl StartResponse {
    fn started(id: OperationId) -> Self {
        Self {
            ok: true,
            operation_id: Some(id),
            noop: false,
        }
    }

    fn noop() -> Self {
        Self {
            ok: true,
            operation_id: None,
            noop: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantStatus {
    pub shard_id: ShardId,
    pub role: Role,
    pub state: String,
    /// Highest donor sequence number applied, per donor (recipients only)
    pub last_applied: BTreeMap<ShardId, u64>,
    pub documents_remaining: Option<u64>,
    pub documents_copied: Option<u64>,
    pub lag_ms: Option<u64>,
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStatus {
    pub operation_id: OperationId,
    pub namespace: String,
    pub operation_type: OperationType,
    pub state: OperationState,
    pub elapsed_ms: u64,
    pub estimated_time_remaining_ms: Option<u64>,
    pub participants: Vec<ParticipantStatus>,
    pub abort_reason: Option<OperationError>,
    pub outcome: Option<Outcome>,
    pub phase_started_at: BTreeMap<String, u64>,
    pub critical_section_started_at: Option<u64>,
    pub critical_section_expires_at: Option<u64>,
}

/// Result of one `advance` pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The state changed; run another pass right away
    Advanced,
    /// Waiting on participants
    Waiting,
    /// `Done`
    Finished,
}

/// Errors that end an operation when they surface before `Committing`
fn is_fatal(e: &Error) -> bool {
    matches!(
        e,
        Error::ParticipantFailed { .. }
            | Error::Io(_)
            | Error::Corrupted(_)
            | Error::ChangeLog(_)
            | Error::InvariantViolation(_)
            | Error::OperationAborted(_)
            | Error::DuplicateKey { .. }
            | Error::SchemaValidation(_)
            | Error::InvalidDocument(_)
            | Error::InvalidOptions(_)
            | Error::InvalidKeyPattern(_)
            | Error::NamespaceNotFound(_)
    )
}

pub struct CoordinatorService {
    documents: Arc<dyn DocumentStore>,
    routing: Arc<dyn RoutingStore>,
    directory: Arc<ShardDirectory>,
    config: CoordinatorConfig,
    migration: MigrationConfig,
    locks: Mutex<HashMap<OperationId, Arc<tokio::sync::Mutex<()>>>>,
    aborts: Mutex<HashMap<OperationId, watch::Sender<bool>>>,
    runners: Mutex<HashMap<OperationId, JoinHandle<()>>>,
    estimates: Mutex<HashMap<OperationId, Duration>>,
    overrun_alerted: Mutex<HashSet<OperationId>>,
    start_lock: tokio::sync::Mutex<()>,
    self_ref: Weak<CoordinatorService>,
}

impl CoordinatorService {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        routing: Arc<dyn RoutingStore>,
        directory: Arc<ShardDirectory>,
        config: CoordinatorConfig,
        migration: MigrationConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| CoordinatorService {
            documents,
            routing,
            directory,
            config,
            migration,
            locks: Mutex::new(HashMap::new()),
            aborts: Mutex::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
            estimates: Mutex::new(HashMap::new()),
            overrun_alerted: Mutex::new(HashSet::new()),
            start_lock: tokio::sync::Mutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn directory(&self) -> &Arc<ShardDirectory> {
        &self.directory
    }

    pub fn routing_store(&self) -> &Arc<dyn RoutingStore> {
        &self.routing
    }

    pub fn document_store(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy {
            retries: self.config.rpc_retries,
            backoff: self.config.rpc_backoff(),
        }
    }

    fn op_lock(&self, id: OperationId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(id)
            .or_default()
            .clone()
    }

    fn abort_signal(&self, id: OperationId) -> watch::Sender<bool> {
        self.aborts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(id)
            .or_insert_with(|| watch::channel(false).0)
            .clone()
    }

    fn load_operation(&self, id: &OperationId) -> Result<OperationDocument> {
        self.documents
            .get_operation(id)?
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))
    }

    fn save(&self, doc: &mut OperationDocument) -> Result<()> {
        doc.updated_at = timestamp_now_millis();
        self.documents.put_operation(doc)
    }

    fn transition(&self, doc: &mut OperationDocument, next: OperationState) -> Result<()> {
        let from = doc.state;
        doc.transition(next)?;
        self.save(doc)?;
        tracing::info!(
            operation_id = %doc.operation_id,
            namespace = %doc.namespace,
            from = %from,
            to = %next,
            "operation state changed"
        );
        Ok(())
    }

    // === Participant calls ===

    /// Call one participant with retries and track its reachability
    async fn call<T, F, Fut>(&self, doc: &mut OperationDocument, shard: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn ShardClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = retry_with_backoff(
            || {
                let call = self.directory.get(shard).map(&f);
                async move { call?.await }
            },
            self.config.rpc_retries,
            self.config.rpc_backoff(),
        )
        .await;
        match &result {
            Err(e) if e.is_unreachable() => {
                METRICS.participant_rpc_errors.inc();
                doc.unreachable_since
                    .entry(shard.to_string())
                    .or_insert_with(timestamp_now_millis);
            }
            Err(_) => METRICS.participant_rpc_errors.inc(),
            Ok(_) => {
                doc.unreachable_since.remove(shard);
            }
        }
        result
    }

    /// Reports of every participant in `role`. A participant in `Error` or
    /// one keyed to a different clone timestamp fails the pass.
    async fn reports(
        &self,
        doc: &mut OperationDocument,
        role: Role,
    ) -> Result<BTreeMap<ShardId, ParticipantDocument>> {
        let op = doc.operation_id;
        let shards = match role {
            Role::Donor => doc.donor_shards.clone(),
            Role::Recipient => doc.recipient_shards.clone(),
        };
        let mut out = BTreeMap::new();
        for shard in shards {
            let report = self
                .call(doc, &shard, |c| async move { c.report(op, role).await })
                .await?;
            let Some(report) = report else {
                return Err(Error::NotReady {
                    shard,
                    reason: format!("no {} document yet", role),
                });
            };
            if report.clone_timestamp != doc.clone_timestamp {
                return Err(Error::InvariantViolation(format!(
                    "{} {} reports clone timestamp {}, operation {} fixed {}",
                    role, shard, report.clone_timestamp, op, doc.clone_timestamp
                )));
            }
            if report.is_error() {
                return Err(Error::ParticipantFailed {
                    shard,
                    reason: report
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "participant in error state".into()),
                });
            }
            out.insert(shard, report);
        }
        Ok(out)
    }

    /// Routing table the operation started from
    fn source_routing(&self, doc: &OperationDocument) -> Result<CollectionRouting> {
        let routing = self
            .routing
            .get_routing(&doc.namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(doc.namespace.clone()))?;
        if routing.epoch != doc.routing_epoch {
            return Err(Error::InvariantViolation(format!(
                "routing for {} moved from epoch {} to {} under operation {}",
                doc.namespace, doc.routing_epoch, routing.epoch, doc.operation_id
            )));
        }
        Ok(routing)
    }

    fn donor_ranges(doc: &OperationDocument, routing: &CollectionRouting, donor: &str) -> Vec<KeyRange> {
        match doc.operation_type {
            OperationType::MoveRange => vec![doc.source_range.clone()],
            OperationType::Reshard => routing.ranges_owned_by(donor),
        }
    }

    fn recipient_ranges(doc: &OperationDocument, recipient: &str) -> Vec<KeyRange> {
        match doc.operation_type {
            OperationType::MoveRange => vec![doc.source_range.clone()],
            OperationType::Reshard => doc
                .destination_chunks
                .iter()
                .filter(|c| c.shard == recipient)
                .map(|c| c.range.clone())
                .collect(),
        }
    }

    // === Start ===

    /// Register a new sharded collection with its first routing table and
    /// create its physical collection on every shard
    pub async fn shard_collection(&self, request: ShardCollectionRequest) -> Result<CollectionRouting> {
        validate_namespace(&request.namespace)?;
        request.key_pattern.validate()?;
        request.options.validate()?;

        if let Some(existing) = self.routing.get_routing(&request.namespace)? {
            if existing.key_pattern == request.key_pattern {
                return Ok(existing);
            }
            return Err(Error::InvalidOptions(format!(
                "{} is already sharded on {}",
                request.namespace, existing.key_pattern
            )));
        }

        let shards = self.directory.shard_ids();
        let chunks = match request.chunks {
            Some(chunks) => chunks,
            None => {
                let first = shards.first().ok_or_else(|| {
                    Error::UnsatisfiableCommitQuorum("no shards registered".into())
                })?;
                vec![Chunk::new(KeyRange::full(), first.clone())]
            }
        };
        for chunk in &chunks {
            if !self.directory.contains(&chunk.shard) {
                return Err(Error::InvalidOptions(format!("unknown shard {}", chunk.shard)));
            }
        }

        let routing = CollectionRouting::create(&request.namespace, request.key_pattern, chunks)?
            .with_options(request.options.clone());
        for shard in &shards {
            let client = self.directory.get(shard)?;
            client
                .create_physical_collection(&routing.physical, request.options.clone())
                .await?;
        }
        self.routing
            .compare_and_swap(&request.namespace, None, &routing)?;

        tracing::info!(
            namespace = %routing.namespace,
            key_pattern = %routing.key_pattern,
            chunks = routing.chunks.len(),
            "collection sharded"
        );
        Ok(routing)
    }

    /// `StartRangeMigration`: move `range` to `to_shard`
    pub async fn start_range_migration(&self, request: MoveRangeRequest) -> Result<StartResponse> {
        validate_namespace(&request.namespace)?;
        let routing = self
            .routing
            .get_routing(&request.namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(request.namespace.clone()))?;
        let donor = routing
            .sole_owner_of_range(&request.range)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidOptions(format!(
                    "range {} of {} spans several owners",
                    request.range, request.namespace
                ))
            })?;
        if donor == request.to_shard {
            tracing::info!(
                namespace = %request.namespace,
                range = %request.range,
                shard = %donor,
                "range already owned by the target shard"
            );
            return Ok(StartResponse::noop());
        }

        let operation_id = OperationId::generate();
        let destination_chunks = vec![Chunk::new(request.range.clone(), request.to_shard.clone())];
        let now = timestamp_now_millis();
        let doc = OperationDocument {
            operation_id,
            namespace: request.namespace.clone(),
            operation_type: OperationType::MoveRange,
            state: OperationState::Initializing,
            donor_shards: BTreeSet::from([donor]),
            recipient_shards: BTreeSet::from([request.to_shard]),
            source_key_pattern: routing.key_pattern.clone(),
            destination_key_pattern: routing.key_pattern.clone(),
            source_range: request.range,
            destination_chunks,
            source_physical: routing.physical.clone(),
            destination_physical: routing.physical.clone(),
            clone_timestamp: now,
            routing_epoch: routing.epoch,
            force_redistribution: false,
            donor_snapshots: BTreeMap::new(),
            fence_token: None,
            fence_points: BTreeMap::new(),
            critical_section_attempts: 0,
            critical_section_started_at: None,
            critical_section_expires_at: None,
            abort_reason: None,
            unreachable_since: BTreeMap::new(),
            phase_started_at: BTreeMap::from([(OperationState::Initializing, now)]),
            created_at: now,
            updated_at: now,
        };
        self.start_operation(doc).await
    }

    /// `StartReshard`: repartition the namespace on `new_key_pattern`
    pub async fn start_reshard(&self, request: ReshardRequest) -> Result<StartResponse> {
        validate_namespace(&request.namespace)?;
        request.new_key_pattern.validate()?;
        let routing = self
            .routing
            .get_routing(&request.namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(request.namespace.clone()))?;

        if routing.key_pattern == request.new_key_pattern && !request.force_redistribution {
            tracing::info!(
                namespace = %request.namespace,
                key_pattern = %request.new_key_pattern,
                "collection already sharded on the requested key"
            );
            return Ok(StartResponse::noop());
        }

        // Every existing document must have a key under the new pattern
        let samples = self.sample_keys(&routing, &request.new_key_pattern).await?;
        let chunks = match request.chunks {
            Some(chunks) => {
                validate_chunks(&chunks)?;
                chunks
            }
            None => self.chunks_from_samples(samples)?,
        };

        let operation_id = OperationId::generate();
        let short = operation_id.0.simple().to_string();
        let destination_physical = match request.namespace.split_once('.') {
            Some((db, coll)) => format!("{}.__reshard_{}_{}", db, coll, &short[..8]),
            None => format!("{}.__reshard_{}", request.namespace, &short[..8]),
        };

        let now = timestamp_now_millis();
        let doc = OperationDocument {
            operation_id,
            namespace: request.namespace.clone(),
            operation_type: OperationType::Reshard,
            state: OperationState::Initializing,
            donor_shards: routing.shards(),
            recipient_shards: chunks.iter().map(|c| c.shard.clone()).collect(),
            source_key_pattern: routing.key_pattern.clone(),
            destination_key_pattern: request.new_key_pattern,
            source_range: KeyRange::full(),
            destination_chunks: chunks,
            source_physical: routing.physical.clone(),
            destination_physical,
            clone_timestamp: now,
            routing_epoch: routing.epoch,
            force_redistribution: request.force_redistribution,
            donor_snapshots: BTreeMap::new(),
            fence_token: None,
            fence_points: BTreeMap::new(),
            critical_section_attempts: 0,
            critical_section_started_at: None,
            critical_section_expires_at: None,
            abort_reason: None,
            unreachable_since: BTreeMap::new(),
            phase_started_at: BTreeMap::from([(OperationState::Initializing, now)]),
            created_at: now,
            updated_at: now,
        };
        self.start_operation(doc).await
    }

    /// Keys under `pattern` sampled from every current owner. Fails if any
    /// owned document has no valid key under `pattern`.
    async fn sample_keys(&self, routing: &CollectionRouting, pattern: &KeyPattern) -> Result<Vec<ShardKey>> {
        let mut keys: Vec<ShardKey> = Vec::new();
        for owner in routing.shards() {
            let client = self.directory.get(&owner).map_err(|e| {
                Error::UnsatisfiableCommitQuorum(format!("cannot sample {}: {}", owner, e))
            })?;
            keys.extend(
                client
                    .sample_keys(&routing.namespace, routing.epoch, pattern, SAMPLES_PER_SHARD)
                    .await?,
            );
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Split points taken from sampled keys, dealt over every registered
    /// shard
    fn chunks_from_samples(&self, keys: Vec<ShardKey>) -> Result<Vec<Chunk>> {
        let shards = self.directory.shard_ids();
        if shards.is_empty() {
            return Err(Error::UnsatisfiableCommitQuorum("no shards registered".into()));
        }

        let mut splits = Vec::new();
        if !keys.is_empty() {
            for i in 1..shards.len() {
                splits.push(keys[i * keys.len() / shards.len()].clone());
            }
        }
        chunks_from_split_points(&splits, &shards)
    }

    async fn start_operation(&self, mut doc: OperationDocument) -> Result<StartResponse> {
        let _start = self.start_lock.lock().await;

        if let Some(existing) = self
            .documents
            .list_operations()?
            .into_iter()
            .find(|o| o.namespace == doc.namespace && o.state != OperationState::Done)
        {
            return Err(Error::ConflictingOperation {
                namespace: doc.namespace.clone(),
                operation_id: existing.operation_id.to_string(),
            });
        }

        for shard in doc.participants() {
            let reachable = retry_with_backoff(
                || {
                    let client = self.directory.get(&shard);
                    async move { client?.ping().await }
                },
                self.config.rpc_retries,
                self.config.rpc_backoff(),
            )
            .await;
            if let Err(e) = reachable {
                return Err(Error::UnsatisfiableCommitQuorum(format!(
                    "participant {} unreachable: {}",
                    shard, e
                )));
            }
        }

        self.save(&mut doc)?;
        METRICS.operations_started.inc();
        METRICS.operations_in_flight.inc();
        tracing::info!(
            operation_id = %doc.operation_id,
            namespace = %doc.namespace,
            operation_type = ?doc.operation_type,
            donors = ?doc.donor_shards,
            recipients = ?doc.recipient_shards,
            clone_timestamp = doc.clone_timestamp,
            "operation started"
        );

        self.spawn_runner(doc.operation_id);
        Ok(StartResponse::started(doc.operation_id))
    }

    // === Runner ===

    fn spawn_runner(&self, id: OperationId) {
        let Some(service) = self.self_ref.upgrade() else {
            return;
        };
        let mut runners = self
            .runners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if runners.get(&id).map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        runners.insert(id, tokio::spawn(service.run_operation(id)));
    }

    async fn run_operation(self: Arc<Self>, id: OperationId) {
        loop {
            match self.advance(id).await {
                Ok(Progress::Finished) => break,
                Ok(Progress::Advanced) => tokio::task::yield_now().await,
                Ok(Progress::Waiting) => tokio::time::sleep(self.config.advance_interval()).await,
                Err(Error::NotFound(_)) => break,
                Err(e) => {
                    tracing::warn!(operation_id = %id, error = %e, "advance failed, retrying");
                    tokio::time::sleep(self.config.advance_interval()).await;
                }
            }
        }
        self.estimates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        self.overrun_alerted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        tracing::debug!(operation_id = %id, "operation runner finished");
    }

    /// Re-attach to every unfinished operation after a restart
    pub fn resume_all(&self) -> Result<usize> {
        let pending: Vec<OperationDocument> = self
            .documents
            .list_operations()?
            .into_iter()
            .filter(|o| o.state != OperationState::Done)
            .collect();
        METRICS.operations_in_flight.set(pending.len() as u64);
        for doc in &pending {
            tracing::info!(
                operation_id = %doc.operation_id,
                namespace = %doc.namespace,
                state = %doc.state,
                "resuming operation"
            );
            self.spawn_runner(doc.operation_id);
        }
        Ok(pending.len())
    }

    /// Stop every runner. Persisted state is left as is for the next start.
    pub fn shutdown(&self) {
        let runners: Vec<JoinHandle<()>> = self
            .runners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in runners {
            handle.abort();
        }
    }

    // === Advance ===

    /// One idempotent pass over the operation's current state
    pub async fn advance(&self, id: OperationId) -> Result<Progress> {
        let lock = self.op_lock(id);
        let _held = lock.lock().await;
        let mut doc = self.load_operation(&id)?;

        match self.step(&mut doc).await {
            Ok(progress) => Ok(progress),
            Err(e) => self.handle_step_error(&mut doc, e),
        }
    }

    async fn step(&self, doc: &mut OperationDocument) -> Result<Progress> {
        match doc.state {
            OperationState::Initializing => self.step_initializing(doc).await,
            OperationState::Cloning => self.step_cloning(doc).await,
            OperationState::Applying => self.step_applying(doc).await,
            OperationState::MonitoringCommit => self.step_monitoring(doc).await,
            OperationState::BlockingWrites => self.step_blocking(doc).await,
            OperationState::Committing => self.step_committing(doc).await,
            OperationState::Committed => self.step_committed(doc).await,
            OperationState::Aborting => self.step_aborting(doc).await,
            OperationState::Aborted => self.step_aborted(doc).await,
            OperationState::Done => Ok(Progress::Finished),
        }
    }

    fn handle_step_error(&self, doc: &mut OperationDocument, e: Error) -> Result<Progress> {
        let op = doc.operation_id;

        if matches!(e, Error::InvariantViolation(_)) {
            METRICS.invariant_violations.inc();
            tracing::error!(
                operation_id = %op,
                state = %doc.state,
                error = %e,
                "invariant violation"
            );
        }

        if doc.state.is_abortable() {
            let reason = if is_fatal(&e) {
                Some(e.to_operation_error())
            } else {
                self.stalled_participant(doc).map(|(shard, for_ms)| {
                    OperationError::new(
                        ErrorKind::ParticipantUnreachable,
                        format!("participant {} unreachable for {} ms", shard, for_ms),
                    )
                })
            };
            if let Some(reason) = reason {
                tracing::warn!(
                    operation_id = %op,
                    state = %doc.state,
                    reason = %reason,
                    "aborting operation"
                );
                doc.begin_abort(reason)?;
                self.save(doc)?;
                return Ok(Progress::Advanced);
            }
        }

        tracing::warn!(
            operation_id = %op,
            state = %doc.state,
            error = %e,
            "operation pass failed, will retry"
        );
        if let Err(save_err) = self.save(doc) {
            tracing::warn!(operation_id = %op, error = %save_err, "failed to persist operation");
        }
        Ok(Progress::Waiting)
    }

    fn stalled_participant(&self, doc: &OperationDocument) -> Option<(ShardId, u64)> {
        let now = timestamp_now_millis();
        let timeout = self.config.participant_timeout_ms;
        doc.unreachable_since
            .iter()
            .map(|(shard, since)| (shard.clone(), now.saturating_sub(*since)))
            .find(|(_, for_ms)| *for_ms > timeout)
    }

    async fn step_initializing(&self, doc: &mut OperationDocument) -> Result<Progress> {
        let op = doc.operation_id;
        let routing = self.source_routing(doc)?;

        for donor in doc.donor_shards.clone() {
            let instruction = DonorInstruction {
                operation_id: op,
                operation_type: doc.operation_type,
                namespace: doc.namespace.clone(),
                clone_timestamp: doc.clone_timestamp,
                source_physical: doc.source_physical.clone(),
                source_key_pattern: doc.source_key_pattern.clone(),
                ranges: Self::donor_ranges(doc, &routing, &donor),
            };
            let snapshot = self
                .call(doc, &donor, |c| {
                    let instruction = instruction.clone();
                    async move { c.prepare_to_donate(instruction).await }
                })
                .await?;
            if snapshot.clone_timestamp != doc.clone_timestamp {
                return Err(Error::InvariantViolation(format!(
                    "donor {} prepared at clone timestamp {}, operation {} fixed {}",
                    donor, snapshot.clone_timestamp, op, doc.clone_timestamp
                )));
            }
            doc.donor_snapshots.insert(donor, snapshot);
        }

        for recipient in doc.recipient_shards.clone() {
            let instruction = RecipientInstruction {
                operation_id: op,
                operation_type: doc.operation_type,
                namespace: doc.namespace.clone(),
                clone_timestamp: doc.clone_timestamp,
                destination_physical: doc.destination_physical.clone(),
                destination_key_pattern: doc.destination_key_pattern.clone(),
                ranges: Self::recipient_ranges(doc, &recipient),
                donors: doc.donor_shards.clone(),
                options: routing.options.clone(),
            };
            self.call(doc, &recipient, |c| {
                let instruction = instruction.clone();
                async move { c.create_collection(instruction).await }
            })
            .await?;
        }

        self.transition(doc, OperationState::Cloning)?;
        Ok(Progress::Advanced)
    }

    async fn step_cloning(&self, doc: &mut OperationDocument) -> Result<Progress> {
        let op = doc.operation_id;
        let snapshots: Vec<SnapshotDescriptor> = doc.donor_snapshots.values().cloned().collect();

        for recipient in doc.recipient_shards.clone() {
            self.call(doc, &recipient, |c| {
                let snapshots = snapshots.clone();
                async move { c.clone_initial_data(op, snapshots).await }
            })
            .await?;
        }

        self.reports(doc, Role::Donor).await?;
        let reports = self.reports(doc, Role::Recipient).await?;
        let cloned = reports.values().all(|r| {
            r.recipient()
                .map(|r| r.clone_complete())
                .unwrap_or(false)
        });
        if !cloned {
            return Ok(Progress::Waiting);
        }

        self.transition(doc, OperationState::Applying)?;
        Ok(Progress::Advanced)
    }

    async fn step_applying(&self, doc: &mut OperationDocument) -> Result<Progress> {
        self.reports(doc, Role::Donor).await?;
        self.reports(doc, Role::Recipient).await?;

        let source = RecipientLagSource::new(self, doc);
        let lag = match source.sample().await {
            Ok(lag) => lag,
            Err(e) => return Err(source.note_failure(doc, e)),
        };
        if lag >= self.migration.commit_lag_threshold() {
            return Ok(Progress::Waiting);
        }

        self.transition(doc, OperationState::MonitoringCommit)?;
        Ok(Progress::Advanced)
    }

    async fn step_monitoring(&self, doc: &mut OperationDocument) -> Result<Progress> {
        let op = doc.operation_id;
        self.reports(doc, Role::Donor).await?;
        self.reports(doc, Role::Recipient).await?;

        if doc.fence_token.is_some() {
            // An earlier attempt may have left guards behind
            release_all(&self.directory, op, &doc.donor_shards, self.release_policy()).await?;
        }

        let mut cancel = self.abort_signal(op).subscribe();
        let source = RecipientLagSource::new(self, doc);
        let monitor = CommitMonitor::new(
            &source,
            CommitReadiness::from_config(&self.migration),
            self.migration.commit_poll_interval(),
        );
        let outcome = monitor
            .run(&mut cancel, |readiness, interval| {
                if let Some(estimate) = readiness.estimate_remaining(interval) {
                    self.estimates
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(op, estimate);
                }
            })
            .await;
        match outcome {
            Ok(MonitorOutcome::Ready) => {}
            Ok(MonitorOutcome::Cancelled) => return Ok(Progress::Waiting),
            Err(e) => return Err(source.note_failure(doc, e)),
        }

        if doc.critical_section_attempts >= self.migration.critical_section_acquire_attempts {
            return Err(Error::OperationAborted(format!(
                "critical section not granted after {} attempts",
                doc.critical_section_attempts
            )));
        }

        let token = self.routing.next_fence_token()?;
        doc.fence_token = Some(token);
        doc.critical_section_attempts += 1;
        self.save(doc)?;

        match acquire_all(&self.directory, op, &doc.donor_shards, token, self.release_policy()).await {
            Ok(points) => {
                let now = timestamp_now_millis();
                doc.fence_points = points;
                doc.critical_section_started_at = Some(now);
                doc.critical_section_expires_at =
                    Some(now + self.migration.critical_section_max_ms);
                self.transition(doc, OperationState::BlockingWrites)?;
                Ok(Progress::Advanced)
            }
            Err(e) if e.is_retryable() => {
                METRICS.critical_section_acquire_failures.inc();
                tracing::warn!(
                    operation_id = %op,
                    fence_token = token,
                    attempt = doc.critical_section_attempts,
                    error = %e,
                    "critical section not acquired on every donor, will retry"
                );
                self.save(doc)?;
                Ok(Progress::Waiting)
            }
            Err(e) => Err(e),
        }
    }

    async fn step_blocking(&self, doc: &mut OperationDocument) -> Result<Progress> {
        let op = doc.operation_id;
        self.check_overrun(doc);

        let fence_points = doc.fence_points.clone();
        for recipient in doc.recipient_shards.clone() {
            self.call(doc, &recipient, |c| {
                let fence_points = fence_points.clone();
                async move { c.apply_change_stream(op, fence_points).await }
            })
            .await?;
        }

        self.reports(doc, Role::Donor).await?;
        let reports = self.reports(doc, Role::Recipient).await?;
        let caught_up = reports.values().all(|r| {
            r.recipient()
                .map(|r| r.reached_fence())
                .unwrap_or(false)
        });
        if !caught_up {
            return Ok(Progress::Waiting);
        }

        self.transition(doc, OperationState::Committing)?;
        Ok(Progress::Advanced)
    }

    fn check_overrun(&self, doc: &OperationDocument) {
        let Some(expires_at) = doc.critical_section_expires_at else {
            return;
        };
        if timestamp_now_millis() <= expires_at {
            return;
        }
        let first = self
            .overrun_alerted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(doc.operation_id);
        if first {
            METRICS.critical_section_overruns.inc();
            tracing::error!(
                operation_id = %doc.operation_id,
                namespace = %doc.namespace,
                max_ms = self.migration.critical_section_max_ms,
                "critical section held longer than allowed"
            );
        }
    }

    async fn step_committing(&self, doc: &mut OperationDocument) -> Result<Progress> {
        let op = doc.operation_id;
        self.check_overrun(doc);
        let current = self
            .routing
            .get_routing(&doc.namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(doc.namespace.clone()))?;

        if current.committed_by(&op, doc.routing_epoch) {
            tracing::debug!(operation_id = %op, epoch = current.epoch, "routing already switched");
        } else if current.epoch == doc.routing_epoch {
            let next = match doc.operation_type {
                OperationType::MoveRange => {
                    let to_shard = doc.recipient_shards.iter().next().ok_or_else(|| {
                        Error::InvariantViolation(format!("operation {} has no recipient", op))
                    })?;
                    current.with_moved_range(&doc.source_range, to_shard, op)?
                }
                OperationType::Reshard => current.with_reshard(
                    doc.destination_key_pattern.clone(),
                    doc.destination_chunks.clone(),
                    doc.destination_physical.clone(),
                    op,
                )?,
            };
            self.routing
                .compare_and_swap(&doc.namespace, Some(doc.routing_epoch), &next)?;
            tracing::info!(
                operation_id = %op,
                namespace = %doc.namespace,
                epoch = next.epoch,
                "routing switched"
            );
        } else {
            return Err(Error::InvariantViolation(format!(
                "routing for {} is at epoch {}, expected {} or its successor by {}",
                doc.namespace, current.epoch, doc.routing_epoch, op
            )));
        }

        self.transition(doc, OperationState::Committed)?;
        METRICS.operations_committed.inc();
        if let Some(started) = doc.critical_section_started_at {
            let held = timestamp_now_millis().saturating_sub(started);
            METRICS
                .critical_section_duration
                .observe_duration(Duration::from_millis(held));
        }
        Ok(Progress::Advanced)
    }

    async fn step_committed(&self, doc: &mut OperationDocument) -> Result<Progress> {
        let op = doc.operation_id;
        for donor in doc.donor_shards.clone() {
            self.call(doc, &donor, |c| async move { c.commit(op, Role::Donor).await })
                .await?;
        }
        for recipient in doc.recipient_shards.clone() {
            self.call(doc, &recipient, |c| async move {
                c.commit(op, Role::Recipient).await
            })
            .await?;
        }
        self.forget_participants(doc).await?;

        self.transition(doc, OperationState::Done)?;
        METRICS.operations_in_flight.dec();
        tracing::info!(
            operation_id = %op,
            namespace = %doc.namespace,
            elapsed_ms = doc.elapsed_ms(),
            "operation committed"
        );
        Ok(Progress::Finished)
    }

    async fn step_aborting(&self, doc: &mut OperationDocument) -> Result<Progress> {
        let op = doc.operation_id;
        for donor in doc.donor_shards.clone() {
            self.call(doc, &donor, |c| async move { c.abort(op, Role::Donor).await })
                .await?;
        }
        for recipient in doc.recipient_shards.clone() {
            self.call(doc, &recipient, |c| async move {
                c.abort(op, Role::Recipient).await
            })
            .await?;
        }

        self.transition(doc, OperationState::Aborted)?;
        METRICS.operations_aborted.inc();
        Ok(Progress::Advanced)
    }

    async fn step_aborted(&self, doc: &mut OperationDocument) -> Result<Progress> {
        self.forget_participants(doc).await?;
        self.transition(doc, OperationState::Done)?;
        METRICS.operations_in_flight.dec();
        tracing::info!(
            operation_id = %doc.operation_id,
            namespace = %doc.namespace,
            reason = ?doc.abort_reason,
            elapsed_ms = doc.elapsed_ms(),
            "operation aborted"
        );
        Ok(Progress::Finished)
    }

    async fn forget_participants(&self, doc: &mut OperationDocument) -> Result<()> {
        let op = doc.operation_id;
        for donor in doc.donor_shards.clone() {
            self.call(doc, &donor, |c| async move { c.forget(op, Role::Donor).await })
                .await?;
        }
        for recipient in doc.recipient_shards.clone() {
            self.call(doc, &recipient, |c| async move {
                c.forget(op, Role::Recipient).await
            })
            .await?;
        }
        Ok(())
    }

    // === Abort ===

    /// `RequestAbort`. Accepted strictly before `Committing`; repeated
    /// aborts of an aborting operation succeed.
    pub async fn request_abort(&self, id: OperationId, reason: &str) -> Result<()> {
        let doc = self.load_operation(&id)?;
        if doc.state.is_abort_path()
            || (doc.state == OperationState::Done && doc.abort_reason.is_some())
        {
            return Ok(());
        }
        if !doc.state.is_abortable() {
            return Err(Error::OperationAlreadyCommitting(id.to_string()));
        }

        // Wake a commit monitor holding the operation lock
        let signal = self.abort_signal(id);
        signal.send_replace(true);

        let lock = self.op_lock(id);
        let _held = lock.lock().await;
        let mut doc = self.load_operation(&id)?;
        if doc.state.is_abort_path() {
            return Ok(());
        }
        if !doc.state.is_abortable() {
            signal.send_replace(false);
            return Err(Error::OperationAlreadyCommitting(id.to_string()));
        }

        doc.begin_abort(OperationError::user_abort(reason))?;
        self.save(&mut doc)?;
        tracing::warn!(
            operation_id = %id,
            namespace = %doc.namespace,
            reason,
            "abort requested"
        );
        drop(_held);

        self.spawn_runner(id);
        Ok(())
    }

    /// `AbortOperation{namespace}`: abort the in-flight operation on `namespace`
    pub async fn request_abort_namespace(&self, namespace: &str, reason: &str) -> Result<OperationId> {
        let doc = self
            .documents
            .list_operations()?
            .into_iter()
            .find(|o| o.namespace == namespace && o.state != OperationState::Done)
            .ok_or_else(|| Error::NotFound(format!("no operation in flight on {}", namespace)))?;
        self.request_abort(doc.operation_id, reason).await?;
        Ok(doc.operation_id)
    }

    // === Observation ===

    /// `WaitForCompletion`: poll until the operation commits or aborts
    pub async fn wait_for_completion(&self, id: OperationId, timeout: Option<Duration>) -> Result<Outcome> {
        let wait = async {
            loop {
                let doc = self.load_operation(&id)?;
                if let Some(outcome) = doc.outcome() {
                    return Ok(outcome);
                }
                tokio::time::sleep(self.config.advance_interval()).await;
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                Error::Timeout(format!("operation {} still running after {:?}", id, limit))
            })?,
            None => wait.await,
        }
    }

    pub fn get_operation(&self, id: &OperationId) -> Result<OperationDocument> {
        self.load_operation(id)
    }

    pub fn list(&self) -> Result<Vec<OperationDocument>> {
        let mut ops = self.documents.list_operations()?;
        ops.sort_by_key(|o| o.created_at);
        Ok(ops)
    }

    /// `GetOperationStatus`. Participant details are best effort.
    pub async fn status(&self, id: OperationId) -> Result<OperationStatus> {
        let doc = self.load_operation(&id)?;
        let mut participants = Vec::new();

        let roles = doc
            .donor_shards
            .iter()
            .map(|s| (s.clone(), Role::Donor))
            .chain(doc.recipient_shards.iter().map(|s| (s.clone(), Role::Recipient)));
        for (shard, role) in roles {
            let client = self.directory.get(&shard);
            let report = match &client {
                Ok(c) => c.report(id, role).await,
                Err(_) => Err(Error::ParticipantUnreachable(shard.clone())),
            };
            let mut status = ParticipantStatus {
                shard_id: shard.clone(),
                role,
                state: "unknown".into(),
                last_applied: BTreeMap::new(),
                documents_remaining: None,
                documents_copied: None,
                lag_ms: None,
                error: None,
            };
            match report {
                Ok(Some(p)) => {
                    status.state = p.state_name();
                    status.error = p.error.clone();
                    if let Some(r) = p.recipient() {
                        status.last_applied = r
                            .donors
                            .iter()
                            .map(|(d, c)| (d.clone(), c.last_applied_seq))
                            .collect();
                        status.documents_remaining = Some(r.documents_remaining());
                        status.documents_copied = Some(r.documents_copied);
                        if let Ok(c) = &client {
                            if let Ok(lag) = c.report_lag(id).await {
                                if lag.lag != Duration::MAX {
                                    status.lag_ms = Some(lag.lag.as_millis() as u64);
                                }
                            }
                        }
                    }
                }
                Ok(None) => status.state = "absent".into(),
                Err(e) if e.is_unreachable() => status.state = "unreachable".into(),
                Err(e) => status.error = Some(e.to_operation_error()),
            }
            participants.push(status);
        }

        let estimate = if doc.state.is_terminal() || doc.state.is_abort_path() {
            None
        } else {
            self.estimates
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&id)
                .map(|d| d.as_millis() as u64)
        };

        Ok(OperationStatus {
            operation_id: doc.operation_id,
            namespace: doc.namespace.clone(),
            operation_type: doc.operation_type,
            state: doc.state,
            elapsed_ms: doc.elapsed_ms(),
            estimated_time_remaining_ms: estimate,
            participants,
            abort_reason: doc.abort_reason.clone(),
            outcome: doc.outcome(),
            phase_started_at: doc
                .phase_started_at
                .iter()
                .map(|(s, t)| (s.to_string(), *t))
                .collect(),
            critical_section_started_at: doc.critical_section_started_at,
            critical_section_expires_at: doc.critical_section_expires_at,
        })
    }
}

/// Worst apply lag over an operation's recipients
struct RecipientLagSource<'a> {
    directory: &'a ShardDirectory,
    operation_id: OperationId,
    recipients: Vec<ShardId>,
    retries: usize,
    backoff: Duration,
    failed: Mutex<Option<ShardId>>,
}

impl<'a> RecipientLagSource<'a> {
    fn new(service: &'a CoordinatorService, doc: &OperationDocument) -> Self {
        Self {
            directory: &service.directory,
            operation_id: doc.operation_id,
            recipients: doc.recipient_shards.iter().cloned().collect(),
            retries: service.config.rpc_retries,
            backoff: service.config.rpc_backoff(),
            failed: Mutex::new(None),
        }
    }

    /// Record which recipient could not be reached and hand the error back
    fn note_failure(&self, doc: &mut OperationDocument, e: Error) -> Error {
        if e.is_unreachable() {
            if let Some(shard) = self
                .failed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                doc.unreachable_since
                    .entry(shard)
                    .or_insert_with(timestamp_now_millis);
            }
        }
        e
    }
}

#[async_trait]
impl LagSource for RecipientLagSource<'_> {
    async fn sample(&self) -> Result<Duration> {
        let op = self.operation_id;
        let mut worst = Duration::ZERO;
        for shard in &self.recipients {
            let lag = retry_with_backoff(
                || {
                    let client = self.directory.get(shard);
                    async move { client?.report_lag(op).await }
                },
                self.retries,
                self.backoff,
            )
            .await
            .inspect_err(|_| {
                *self
                    .failed
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(shard.clone());
            })?;
            worst = worst.max(lag.lag);
        }
        Ok(worst)
    }
}
