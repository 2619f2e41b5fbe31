//! Recipient actor
//!
//! `AwaitingStart → CreatingCollection → Cloning → Applying →
//! StrictConsistency → Done`, with `Error` reachable from any non-terminal
//! state.
//!
//! Once cloning starts a background loop pulls snapshot pages and then
//! change batches from every donor. All progress (clone cursor, per-donor
//! high-water mark) is persisted in the participant document after each
//! batch, so a restarted recipient resumes where it stopped.

use crate::common::keys::document_id;
use crate::common::timestamp_now_millis;
use crate::coordinator::document::{
    DonorCursor, OperationId, OperationType, ParticipantBody, ParticipantOutcome, RecipientDocument,
    RecipientState, Role, ShardId, SnapshotDescriptor,
};
use crate::shard::applier::ChangeApplier;
use crate::shard::client::{RecipientInstruction, RecipientLag};
use crate::shard::node::ShardNode;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// In-memory state of a running recipient loop. Never load-bearing: lost
/// on restart and rebuilt by the next pass.
#[derive(Default)]
pub(crate) struct RecipientRuntime {
    handle: Option<JoinHandle<()>>,
    lag: BTreeMap<ShardId, DonorLag>,
    /// Every donor has been polled at least once since the loop started
    sampled: bool,
}

impl RecipientRuntime {
    pub(crate) fn stop(self) {
        if let Some(handle) = self.handle {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DonorLag {
    pending: u64,
    oldest_pending_at: Option<u64>,
}

enum Step {
    Progressed,
    Idle,
    Finished,
}

fn not_a_recipient(op: &OperationId) -> Error {
    Error::Corrupted(format!("participant document for {} is not a recipient", op))
}

fn is_active(state: RecipientState) -> bool {
    matches!(
        state,
        RecipientState::Cloning | RecipientState::Applying | RecipientState::StrictConsistency
    )
}

impl ShardNode {
    fn recipient_finished(&self, op: &OperationId) -> Error {
        Error::OperationAborted(format!("{} already finished on {}", op, self.shard_id))
    }

    pub(super) fn recipient_create_collection(&self, instruction: RecipientInstruction) -> Result<()> {
        let op = instruction.operation_id;
        let _lock = self.participant_guard();

        let mut doc = match self.load(&op, Role::Recipient)? {
            Some(doc) => {
                self.check_clone_timestamp(&doc, instruction.clone_timestamp)?;
                doc
            }
            None => self.new_participant(
                op,
                &instruction.namespace,
                instruction.clone_timestamp,
                ParticipantBody::Recipient(RecipientDocument {
                    state: RecipientState::AwaitingStart,
                    operation_type: instruction.operation_type,
                    destination_physical: instruction.destination_physical.clone(),
                    destination_key_pattern: instruction.destination_key_pattern.clone(),
                    ranges: instruction.ranges.clone(),
                    collection_created: false,
                    donors: instruction
                        .donors
                        .iter()
                        .map(|d| (d.clone(), DonorCursor::default()))
                        .collect(),
                    documents_copied: 0,
                }),
            ),
        };

        let recipient = doc.recipient().ok_or_else(|| not_a_recipient(&op))?;
        match recipient.state {
            RecipientState::Done => return Err(self.recipient_finished(&op)),
            RecipientState::Error => return Err(self.failed(&doc)),
            _ if recipient.collection_created => return Ok(()),
            _ => {}
        }

        if let Some(r) = doc.recipient_mut() {
            r.state = RecipientState::CreatingCollection;
        }
        self.save(&mut doc)?;

        let options = match self.ddl.materialize(
            &self.shard_id,
            &instruction.destination_physical,
            &instruction.options,
        ) {
            Ok(options) => options,
            Err(e) => {
                tracing::warn!(
                    operation_id = %op,
                    shard_id = %self.shard_id,
                    error = %e,
                    "destination collection could not be materialized"
                );
                if let Some(r) = doc.recipient_mut() {
                    r.state = RecipientState::Error;
                }
                doc.error = Some(e.to_operation_error());
                self.save(&mut doc)?;
                return Err(self.failed(&doc));
            }
        };

        {
            let mut storage = self.storage();
            self.create_collection_locked(&mut storage, &instruction.destination_physical, options)?;
        }

        if let Some(r) = doc.recipient_mut() {
            r.collection_created = true;
        }
        self.save(&mut doc)?;

        tracing::info!(
            operation_id = %op,
            shard_id = %self.shard_id,
            physical = %instruction.destination_physical,
            "recipient collection ready"
        );
        Ok(())
    }

    /// Record the donors' snapshot points and start the clone loop
    pub(super) fn recipient_clone(&self, op: OperationId, snapshots: &[SnapshotDescriptor]) -> Result<()> {
        self.modify_participant(&op, Role::Recipient, |doc| {
            let clone_timestamp = doc.clone_timestamp;
            let error = doc.error.clone();
            let recipient = doc.recipient_mut().ok_or_else(|| not_a_recipient(&op))?;
            match recipient.state {
                RecipientState::CreatingCollection if recipient.collection_created => {}
                RecipientState::Cloning
                | RecipientState::Applying
                | RecipientState::StrictConsistency => return Ok(()),
                RecipientState::AwaitingStart | RecipientState::CreatingCollection => {
                    return Err(Error::NotReady {
                        shard: self.shard_id.clone(),
                        reason: "destination collection not created".into(),
                    })
                }
                RecipientState::Done => return Err(self.recipient_finished(&op)),
                RecipientState::Error => {
                    return Err(Error::ParticipantFailed {
                        shard: self.shard_id.clone(),
                        reason: error.map(|e| e.to_string()).unwrap_or_default(),
                    })
                }
            }

            for snapshot in snapshots {
                if snapshot.clone_timestamp != clone_timestamp {
                    return Err(Error::InvariantViolation(format!(
                        "donor {} snapshot taken at clone timestamp {}, recipient {} expects {}",
                        snapshot.shard_id, snapshot.clone_timestamp, self.shard_id, clone_timestamp
                    )));
                }
            }
            for (donor, cursor) in recipient.donors.iter_mut() {
                let snapshot = snapshots
                    .iter()
                    .find(|s| &s.shard_id == donor)
                    .ok_or_else(|| {
                        Error::InvalidOptions(format!("no snapshot for donor {}", donor))
                    })?;
                *cursor = DonorCursor {
                    snapshot_seq: snapshot.snapshot_seq,
                    documents_to_copy: snapshot.documents,
                    last_applied_seq: snapshot.snapshot_seq,
                    ..Default::default()
                };
            }
            recipient.state = RecipientState::Cloning;
            Ok(())
        })?;

        self.ensure_recipient_task(op);
        Ok(())
    }

    /// Record the donors' fence points. The loop keeps applying until every
    /// donor's high-water mark reaches its fence.
    pub(super) fn recipient_apply_to_fence(
        &self,
        op: OperationId,
        fence_points: &BTreeMap<ShardId, u64>,
    ) -> Result<()> {
        self.modify_participant(&op, Role::Recipient, |doc| {
            let error = doc.error.clone();
            let recipient = doc.recipient_mut().ok_or_else(|| not_a_recipient(&op))?;
            match recipient.state {
                RecipientState::Applying | RecipientState::StrictConsistency => {}
                RecipientState::Done => return Err(self.recipient_finished(&op)),
                RecipientState::Error => {
                    return Err(Error::ParticipantFailed {
                        shard: self.shard_id.clone(),
                        reason: error.map(|e| e.to_string()).unwrap_or_default(),
                    })
                }
                _ => {
                    return Err(Error::NotReady {
                        shard: self.shard_id.clone(),
                        reason: "initial copy not finished".into(),
                    })
                }
            }
            for (donor, cursor) in recipient.donors.iter_mut() {
                let fence = fence_points.get(donor).ok_or_else(|| {
                    Error::InvalidOptions(format!("no fence point for donor {}", donor))
                })?;
                cursor.fence_seq = Some(*fence);
            }
            recipient.state = RecipientState::StrictConsistency;
            Ok(())
        })?;

        self.ensure_recipient_task(op);
        Ok(())
    }

    pub(super) fn recipient_lag(&self, op: &OperationId) -> Result<RecipientLag> {
        let doc = self
            .load(op, Role::Recipient)?
            .ok_or_else(|| Error::NotFound(format!("no recipient document for {} on {}", op, self.shard_id)))?;
        if doc.is_error() {
            return Err(self.failed(&doc));
        }
        let recipient = doc.recipient().ok_or_else(|| not_a_recipient(op))?;
        let last_applied = recipient
            .donors
            .iter()
            .map(|(donor, cursor)| (donor.clone(), cursor.last_applied_seq))
            .collect();

        let streaming = matches!(
            recipient.state,
            RecipientState::Applying | RecipientState::StrictConsistency
        );
        let runtimes = self.runtimes();
        let (lag, pending) = match runtimes.get(op) {
            Some(runtime) if streaming && runtime.sampled => {
                let now = timestamp_now_millis();
                let lag_ms = runtime
                    .lag
                    .values()
                    .filter_map(|l| l.oldest_pending_at)
                    .map(|at| now.saturating_sub(at))
                    .max()
                    .unwrap_or(0);
                (
                    Duration::from_millis(lag_ms),
                    runtime.lag.values().map(|l| l.pending).sum(),
                )
            }
            _ => (Duration::MAX, recipient.documents_remaining()),
        };

        Ok(RecipientLag {
            shard_id: self.shard_id.clone(),
            lag,
            pending,
            last_applied,
        })
    }

    pub(super) fn recipient_commit(&self, op: &OperationId) -> Result<()> {
        self.stop_recipient_task(op);

        let _lock = self.participant_guard();
        let Some(mut doc) = self.load(op, Role::Recipient)? else {
            return Ok(());
        };
        if doc.is_done() {
            return match doc.outcome {
                Some(ParticipantOutcome::Aborted) => Err(Error::InvariantViolation(format!(
                    "commit of {} on {} after it was aborted",
                    op, self.shard_id
                ))),
                _ => Ok(()),
            };
        }
        let recipient = doc.recipient().ok_or_else(|| not_a_recipient(op))?;
        if !recipient.reached_fence() {
            return Err(Error::InvariantViolation(format!(
                "commit of {} on {} before reaching the fence",
                op, self.shard_id
            )));
        }
        if let Some(r) = doc.recipient_mut() {
            r.state = RecipientState::Done;
        }
        doc.outcome = Some(ParticipantOutcome::Committed);
        self.save(&mut doc)?;

        tracing::info!(operation_id = %op, shard_id = %self.shard_id, "recipient committed");
        Ok(())
    }

    /// Stop the loop and drop everything copied so far
    pub(super) fn recipient_abort(&self, op: &OperationId) -> Result<()> {
        self.stop_recipient_task(op);

        let _lock = self.participant_guard();
        let Some(mut doc) = self.load(op, Role::Recipient)? else {
            return Ok(());
        };
        if doc.is_done() {
            return match doc.outcome {
                Some(ParticipantOutcome::Committed) => Err(Error::InvariantViolation(format!(
                    "abort of {} on {} after it committed",
                    op, self.shard_id
                ))),
                _ => Ok(()),
            };
        }
        let recipient = doc.recipient().ok_or_else(|| not_a_recipient(op))?.clone();

        let removed = if recipient.collection_created {
            let mut storage = self.storage();
            match recipient.operation_type {
                OperationType::MoveRange => {
                    match storage.collections.get_mut(&recipient.destination_physical) {
                        Some(collection) => collection
                            .remove_ranges(&recipient.destination_key_pattern, &recipient.ranges)?,
                        None => 0,
                    }
                }
                OperationType::Reshard => {
                    let count = storage
                        .collections
                        .get(&recipient.destination_physical)
                        .map(|c| c.len())
                        .unwrap_or(0);
                    self.drop_collection_locked(&mut storage, &recipient.destination_physical)?;
                    count
                }
            }
        } else {
            0
        };

        if let Some(r) = doc.recipient_mut() {
            r.state = RecipientState::Done;
        }
        doc.outcome = Some(ParticipantOutcome::Aborted);
        self.save(&mut doc)?;

        tracing::info!(
            operation_id = %op,
            shard_id = %self.shard_id,
            removed,
            "recipient aborted"
        );
        Ok(())
    }

    // === Background loop ===

    pub(super) fn ensure_recipient_task(&self, op: OperationId) {
        let Some(node) = self.arc() else {
            return;
        };
        let mut runtimes = self.runtimes();
        let runtime = runtimes.entry(op).or_default();
        if runtime.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        runtime.sampled = false;
        runtime.handle = Some(tokio::spawn(run_recipient(node, op)));
    }

    pub(super) fn stop_recipient_task(&self, op: &OperationId) {
        if let Some(runtime) = self.runtimes().remove(op) {
            runtime.stop();
        }
    }

    fn fail_recipient(&self, op: &OperationId, error: &Error) -> Result<()> {
        self.modify_participant(op, Role::Recipient, |doc| {
            if doc.is_done() {
                return Ok(());
            }
            if let Some(r) = doc.recipient_mut() {
                r.state = RecipientState::Error;
            }
            doc.error = Some(error.to_operation_error());
            Ok(())
        })
    }

    async fn recipient_step(&self, op: OperationId) -> Result<Step> {
        let Some(doc) = self.load(&op, Role::Recipient)? else {
            return Ok(Step::Finished);
        };
        let recipient = doc.recipient().ok_or_else(|| not_a_recipient(&op))?.clone();
        match recipient.state {
            RecipientState::Cloning => self.clone_step(op, &recipient).await,
            RecipientState::Applying | RecipientState::StrictConsistency => {
                self.apply_step(op, &recipient).await
            }
            _ => Ok(Step::Finished),
        }
    }

    async fn clone_step(&self, op: OperationId, recipient: &RecipientDocument) -> Result<Step> {
        let Some((donor, cursor)) = recipient.donors.iter().find(|(_, c)| !c.clone_done) else {
            self.modify_participant(&op, Role::Recipient, |doc| {
                if let Some(r) = doc.recipient_mut() {
                    if r.state == RecipientState::Cloning {
                        r.state = RecipientState::Applying;
                    }
                }
                Ok(())
            })?;
            return Ok(Step::Progressed);
        };

        let client = self.directory.get(donor)?;
        let requested = cursor.last_cloned_id.clone();
        let batch = client
            .fetch_snapshot_batch(op, requested.clone(), self.config.clone_batch_size)
            .await?;

        let applier = ChangeApplier::new(
            recipient.destination_key_pattern.clone(),
            recipient.ranges.clone(),
        );
        self.modify_participant(&op, Role::Recipient, |doc| {
            let r = doc.recipient_mut().ok_or_else(|| not_a_recipient(&op))?;
            if r.state != RecipientState::Cloning {
                return Ok(Step::Finished);
            }
            let physical = r.destination_physical.clone();
            let Some(cursor) = r.donors.get_mut(donor) else {
                return Ok(Step::Idle);
            };
            if cursor.last_cloned_id != requested {
                return Ok(Step::Idle);
            }

            let copied = {
                let mut storage = self.storage();
                applier.apply_snapshot(storage.collection_mut(&physical)?, &batch.documents)?
            };
            if let Some(last) = batch.documents.last() {
                cursor.last_cloned_id = Some(document_id(last)?);
            }
            cursor.documents_scanned += batch.documents.len() as u64;
            cursor.clone_done = batch.done;
            r.documents_copied += copied;

            if r.clone_complete() {
                r.state = RecipientState::Applying;
                tracing::info!(
                    operation_id = %op,
                    shard_id = %self.shard_id,
                    documents = r.documents_copied,
                    "recipient initial copy complete"
                );
            }
            Ok(Step::Progressed)
        })
    }

    async fn apply_step(&self, op: OperationId, recipient: &RecipientDocument) -> Result<Step> {
        let applier = ChangeApplier::new(
            recipient.destination_key_pattern.clone(),
            recipient.ranges.clone(),
        );
        let mut progressed = false;

        for (donor, cursor) in &recipient.donors {
            let client = self.directory.get(donor)?;
            let requested = cursor.last_applied_seq;
            let batch = client
                .fetch_changes(op, requested, self.config.apply_batch_size)
                .await?;

            let step = self.modify_participant(&op, Role::Recipient, |doc| {
                let r = doc.recipient_mut().ok_or_else(|| not_a_recipient(&op))?;
                if !is_active(r.state) {
                    return Ok(Step::Finished);
                }
                let physical = r.destination_physical.clone();
                let Some(cursor) = r.donors.get_mut(donor) else {
                    return Ok(Step::Idle);
                };
                if cursor.last_applied_seq != requested {
                    return Ok(Step::Idle);
                }

                let outcome = {
                    let mut storage = self.storage();
                    applier.apply(
                        storage.collection_mut(&physical)?,
                        cursor.last_applied_seq,
                        &batch.mutations,
                    )?
                };
                cursor.last_applied_seq = outcome.last_applied.max(batch.scanned_through);

                let mut runtimes = self.runtimes();
                let runtime = runtimes.entry(op).or_default();
                runtime.lag.insert(
                    donor.clone(),
                    DonorLag {
                        pending: batch.latest_seq.saturating_sub(cursor.last_applied_seq),
                        oldest_pending_at: batch.oldest_pending_at,
                    },
                );

                if cursor.last_applied_seq > requested {
                    Ok(Step::Progressed)
                } else {
                    Ok(Step::Idle)
                }
            })?;

            match step {
                Step::Finished => return Ok(Step::Finished),
                Step::Progressed => progressed = true,
                Step::Idle => {}
            }
        }

        if let Some(runtime) = self.runtimes().get_mut(&op) {
            runtime.sampled = true;
        }
        Ok(if progressed { Step::Progressed } else { Step::Idle })
    }
}

async fn run_recipient(node: Arc<ShardNode>, op: OperationId) {
    let tick = node.config.recipient_tick();
    tracing::debug!(operation_id = %op, shard_id = %node.shard_id, "recipient loop started");

    loop {
        match node.recipient_step(op).await {
            Ok(Step::Progressed) => tokio::task::yield_now().await,
            Ok(Step::Idle) => tokio::time::sleep(tick).await,
            Ok(Step::Finished) => break,
            Err(e) if e.is_retryable() => {
                tracing::debug!(operation_id = %op, shard_id = %node.shard_id, error = %e, "recipient retrying");
                tokio::time::sleep(tick).await;
            }
            Err(e) => {
                tracing::error!(
                    operation_id = %op,
                    shard_id = %node.shard_id,
                    error = %e,
                    "recipient failed"
                );
                if let Err(persist) = node.fail_recipient(&op, &e) {
                    tracing::error!(operation_id = %op, error = %persist, "could not record recipient failure");
                }
                break;
            }
        }
    }

    tracing::debug!(operation_id = %op, shard_id = %node.shard_id, "recipient loop stopped");
}
