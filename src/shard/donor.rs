//! Donor actor
//!
//! `AwaitingStart → DonatingInitialData → DonatingOplogEntries →
//! PreparingToBlockWrites → BlockingWrites → Done`, with `Error` reachable
//! from any non-terminal state.
//!
//! The snapshot and the change-stream start point are taken under the same
//! storage lock, so no write can fall between them. Streaming is a cursor
//! over the collection's change log; nothing is buffered separately.

use crate::common::keys::document_id;
use crate::coordinator::document::{
    DonorDocument, DonorState, OperationId, OperationType, ParticipantBody, ParticipantDocument,
    ParticipantOutcome, Role, SnapshotDescriptor,
};
use crate::shard::client::{ChangeBatch, DonorInstruction, SnapshotBatch};
use crate::shard::collection::in_ranges;
use crate::shard::node::ShardNode;
use crate::{Error, Result};

fn not_a_donor(op: &OperationId) -> Error {
    Error::Corrupted(format!("participant document for {} is not a donor", op))
}

/// Failures of the donor's own data that no retry can fix
fn is_local_fault(e: &Error) -> bool {
    matches!(
        e,
        Error::Io(_)
            | Error::Corrupted(_)
            | Error::ChangeLog(_)
            | Error::NotFound(_)
            | Error::InvalidKeyPattern(_)
            | Error::Internal(_)
    )
}

impl ShardNode {
    /// Move a donor into `Error` after a local failure (storage, change log,
    /// unreadable snapshot) and release its guards. The caller saves `doc`.
    /// Returns the error the coordinator sees.
    fn fail_donor(&self, doc: &mut ParticipantDocument, error: Error) -> Error {
        if doc.is_done() || !is_local_fault(&error) {
            return error;
        }
        let op = doc.operation_id;
        self.guard.release(&op, false);
        if let Some(d) = doc.donor_mut() {
            d.state = DonorState::Error;
        }
        doc.error = Some(error.to_operation_error());
        tracing::error!(
            operation_id = %op,
            shard_id = %self.shard_id,
            error = %error,
            "donor failed"
        );
        self.failed(doc)
    }

    /// Record a local failure found outside the participant lock
    fn fail_donor_by_id(&self, op: &OperationId, error: Error) -> Error {
        if !is_local_fault(&error) {
            return error;
        }
        match self.modify_participant(op, Role::Donor, |doc| Ok(self.fail_donor(doc, error))) {
            Ok(failed) => failed,
            Err(e) => e,
        }
    }

    /// Capture the donated documents and the change-log position they
    /// correspond to, and persist the snapshot
    fn install_snapshot(&self, op: OperationId, donor: &DonorDocument) -> Result<(u64, u64)> {
        let (documents, snapshot_seq) = {
            let storage = self.storage();
            let collection = storage.collection(&donor.source_physical)?;
            let mut documents = Vec::new();
            for d in collection.documents() {
                if in_ranges(&donor.source_key_pattern, &donor.ranges, d)? {
                    documents.push(d.clone());
                }
            }
            (documents, collection.last_seq())
        };
        let count = documents.len() as u64;
        self.store_snapshot(op, documents)?;
        Ok((snapshot_seq, count))
    }

    pub(super) fn donor_prepare(&self, instruction: DonorInstruction) -> Result<SnapshotDescriptor> {
        let op = instruction.operation_id;
        let _lock = self.participant_guard();

        let mut doc = match self.load(&op, Role::Donor)? {
            Some(doc) => {
                self.check_clone_timestamp(&doc, instruction.clone_timestamp)?;
                doc
            }
            None => {
                let mut doc = self.new_participant(
                    op,
                    &instruction.namespace,
                    instruction.clone_timestamp,
                    ParticipantBody::Donor(DonorDocument {
                        state: DonorState::AwaitingStart,
                        operation_type: instruction.operation_type,
                        source_physical: instruction.source_physical.clone(),
                        source_key_pattern: instruction.source_key_pattern.clone(),
                        ranges: instruction.ranges.clone(),
                        snapshot_seq: None,
                        documents_to_copy: 0,
                        fence_token: None,
                        final_seq: None,
                    }),
                );
                self.save(&mut doc)?;
                doc
            }
        };

        let donor = doc.donor().ok_or_else(|| not_a_donor(&op))?.clone();
        match donor.state {
            DonorState::AwaitingStart => {}
            DonorState::Done => {
                return Err(Error::OperationAborted(format!(
                    "{} already finished on {}",
                    op, self.shard_id
                )))
            }
            DonorState::Error => return Err(self.failed(&doc)),
            _ => {
                if let Some(snapshot_seq) = donor.snapshot_seq {
                    return Ok(SnapshotDescriptor {
                        shard_id: self.shard_id.clone(),
                        clone_timestamp: doc.clone_timestamp,
                        snapshot_seq,
                        documents: donor.documents_to_copy,
                    });
                }
            }
        }

        let (snapshot_seq, count) = match self.install_snapshot(op, &donor) {
            Ok(installed) => installed,
            Err(e) => {
                let failed = self.fail_donor(&mut doc, e);
                self.save(&mut doc)?;
                return Err(failed);
            }
        };

        if let Some(donor) = doc.donor_mut() {
            donor.state = DonorState::DonatingInitialData;
            donor.snapshot_seq = Some(snapshot_seq);
            donor.documents_to_copy = count;
        }
        self.save(&mut doc)?;

        tracing::info!(
            operation_id = %op,
            shard_id = %self.shard_id,
            snapshot_seq,
            documents = count,
            "donor snapshot installed"
        );

        Ok(SnapshotDescriptor {
            shard_id: self.shard_id.clone(),
            clone_timestamp: doc.clone_timestamp,
            snapshot_seq,
            documents: count,
        })
    }

    pub(super) fn donor_snapshot_batch(
        &self,
        op: &OperationId,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<SnapshotBatch> {
        let snapshot = self
            .load_snapshot(op)
            .map_err(|e| self.fail_donor_by_id(op, e))?;
        let start = match after_id {
            Some(after) => snapshot.partition_point(|d| {
                document_id(d)
                    .map(|id| id.as_str() <= after)
                    .unwrap_or(true)
            }),
            None => 0,
        };
        let end = start.saturating_add(limit.max(1)).min(snapshot.len());
        Ok(SnapshotBatch {
            documents: snapshot[start..end].to_vec(),
            done: end >= snapshot.len(),
        })
    }

    /// Mutations to the donated ranges after `after_seq`.
    ///
    /// At most `limit` log entries are examined per call.
    pub(super) fn donor_changes(
        &self,
        op: &OperationId,
        after_seq: u64,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let donor = self.modify_participant(op, Role::Donor, |doc| {
            let state = doc.donor().ok_or_else(|| not_a_donor(op))?.state;
            match state {
                DonorState::AwaitingStart => Err(Error::NotReady {
                    shard: self.shard_id.clone(),
                    reason: "snapshot not installed yet".into(),
                }),
                DonorState::Done => Err(Error::OperationAborted(format!(
                    "{} already finished on {}",
                    op, self.shard_id
                ))),
                DonorState::Error => Err(self.failed(doc)),
                DonorState::DonatingInitialData => {
                    let donor = doc.donor_mut().ok_or_else(|| not_a_donor(op))?;
                    donor.state = DonorState::DonatingOplogEntries;
                    tracing::debug!(operation_id = %op, shard_id = %self.shard_id, "donor streaming changes");
                    Ok(donor.clone())
                }
                _ => doc.donor().cloned().ok_or_else(|| not_a_donor(op)),
            }
        })?;

        self.read_changes(&donor, after_seq, limit)
            .map_err(|e| self.fail_donor_by_id(op, e))
    }

    fn read_changes(&self, donor: &DonorDocument, after_seq: u64, limit: usize) -> Result<ChangeBatch> {
        let storage = self.storage();
        let log = storage.collection(&donor.source_physical)?.log();
        let scanned = log.read_after(after_seq, limit.max(1));
        let mut mutations = Vec::new();
        for m in scanned {
            if in_ranges(&donor.source_key_pattern, &donor.ranges, m.op.document())? {
                mutations.push(m.clone());
            }
        }
        let scanned_through = scanned.last().map(|m| m.seq).unwrap_or(after_seq);

        Ok(ChangeBatch {
            mutations,
            scanned_through,
            latest_seq: log.last_seq(),
            oldest_pending_at: log.read_after(scanned_through, 1).first().map(|m| m.written_at),
        })
    }

    /// Block writes to every donated range and return the fence point
    pub(super) fn donor_enter_critical_section(&self, op: OperationId, fence_token: u64) -> Result<u64> {
        let _lock = self.participant_guard();
        let mut doc = self
            .load(&op, Role::Donor)?
            .ok_or_else(|| Error::NotFound(format!("no donor document for {} on {}", op, self.shard_id)))?;
        let donor = doc.donor().ok_or_else(|| not_a_donor(&op))?.clone();

        match donor.state {
            DonorState::DonatingInitialData
            | DonorState::DonatingOplogEntries
            | DonorState::PreparingToBlockWrites => {}
            DonorState::BlockingWrites => {
                if let (Some(token), Some(final_seq)) = (donor.fence_token, donor.final_seq) {
                    if token == fence_token && !self.guard.held_by(&op).is_empty() {
                        return Ok(final_seq);
                    }
                }
            }
            DonorState::AwaitingStart => {
                return Err(Error::NotReady {
                    shard: self.shard_id.clone(),
                    reason: "snapshot not installed yet".into(),
                })
            }
            DonorState::Done => {
                return Err(Error::OperationAborted(format!(
                    "{} already finished on {}",
                    op, self.shard_id
                )))
            }
            DonorState::Error => return Err(self.failed(&doc)),
        }

        if donor.fence_token != Some(fence_token) {
            // Guards left over from an earlier attempt
            self.guard.release(&op, false);
        }

        if let Some(d) = doc.donor_mut() {
            d.state = DonorState::PreparingToBlockWrites;
            d.fence_token = Some(fence_token);
            d.final_seq = None;
        }
        self.save(&mut doc)?;

        let acquired = {
            let storage = self.storage();
            storage
                .collection(&donor.source_physical)
                .map(|c| c.last_seq())
                .and_then(|last_seq| {
                    let mut final_seq = last_seq;
                    for range in &donor.ranges {
                        final_seq = self.guard.try_acquire(
                            &doc.namespace,
                            range,
                            op,
                            fence_token,
                            last_seq,
                        )?;
                    }
                    Ok(final_seq)
                })
        };

        let d = doc.donor_mut().ok_or_else(|| not_a_donor(&op))?;
        match acquired {
            Ok(final_seq) => {
                d.state = DonorState::BlockingWrites;
                d.final_seq = Some(final_seq);
                self.save(&mut doc)?;
                Ok(final_seq)
            }
            Err(e) if is_local_fault(&e) => {
                let failed = self.fail_donor(&mut doc, e);
                self.save(&mut doc)?;
                Err(failed)
            }
            Err(e) => {
                self.guard.release(&op, false);
                d.state = DonorState::DonatingOplogEntries;
                d.fence_token = None;
                self.save(&mut doc)?;
                tracing::warn!(
                    operation_id = %op,
                    shard_id = %self.shard_id,
                    fence_token,
                    error = %e,
                    "critical section not granted"
                );
                Err(e)
            }
        }
    }

    /// Release the guard without committing. No-op if never entered.
    pub(super) fn donor_exit_critical_section(&self, op: &OperationId) -> Result<()> {
        self.guard.release(op, false);

        let _lock = self.participant_guard();
        let Some(mut doc) = self.load(op, Role::Donor)? else {
            return Ok(());
        };
        if let Some(d) = doc.donor_mut() {
            if matches!(
                d.state,
                DonorState::PreparingToBlockWrites | DonorState::BlockingWrites
            ) {
                d.state = DonorState::DonatingOplogEntries;
                d.fence_token = None;
                d.final_seq = None;
                self.save(&mut doc)?;
            }
        }
        Ok(())
    }

    /// Release the guard as `Moved` and drop the donated data
    pub(super) fn donor_commit(&self, op: &OperationId) -> Result<()> {
        let _lock = self.participant_guard();
        let Some(mut doc) = self.load(op, Role::Donor)? else {
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
        let donor = doc.donor().ok_or_else(|| not_a_donor(op))?.clone();

        self.guard.release(op, true);
        let removed = {
            let mut storage = self.storage();
            match donor.operation_type {
                OperationType::MoveRange => match storage.collections.get_mut(&donor.source_physical) {
                    Some(collection) => {
                        collection.remove_ranges(&donor.source_key_pattern, &donor.ranges)?
                    }
                    None => 0,
                },
                OperationType::Reshard => {
                    let count = storage
                        .collections
                        .get(&donor.source_physical)
                        .map(|c| c.len())
                        .unwrap_or(0);
                    self.drop_collection_locked(&mut storage, &donor.source_physical)?;
                    count
                }
            }
        };
        self.drop_snapshot(op)?;

        if let Some(d) = doc.donor_mut() {
            d.state = DonorState::Done;
        }
        doc.outcome = Some(ParticipantOutcome::Committed);
        self.save(&mut doc)?;

        tracing::info!(
            operation_id = %op,
            shard_id = %self.shard_id,
            removed,
            "donor committed"
        );
        Ok(())
    }

    /// Release the guard as `Retry` and drop the snapshot. The donor's data
    /// is never touched.
    pub(super) fn donor_abort(&self, op: &OperationId) -> Result<()> {
        self.guard.release(op, false);
        self.drop_snapshot(op)?;

        let _lock = self.participant_guard();
        let Some(mut doc) = self.load(op, Role::Donor)? else {
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
        if let Some(d) = doc.donor_mut() {
            d.state = DonorState::Done;
        }
        doc.outcome = Some(ParticipantOutcome::Aborted);
        self.save(&mut doc)?;

        tracing::info!(operation_id = %op, shard_id = %self.shard_id, "donor aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::common::keys::{Document, KeyPattern, KeyRange, KeyValue, RangeBound, ShardKey};
    use crate::coordinator::document::{DonorState, OperationId, OperationType, Role};
    use crate::coordinator::metadata::{MemoryMetadataStore, RoutingStore};
    use crate::coordinator::routing::{Chunk, CollectionRouting};
    use crate::shard::client::{DonorInstruction, ShardClient, ShardDirectory};
    use crate::shard::collection::CollectionOptions;
    use crate::shard::critical_section::FenceOutcome;
    use crate::shard::node::{ShardNode, ShardNodeOptions};
    use crate::Error;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn uid(i: i64) -> RangeBound {
        RangeBound::Key(ShardKey(vec![KeyValue::Int(i)]))
    }

    async fn donor_with_data() -> Arc<ShardNode> {
        donor_on(ShardNodeOptions::new("shard-a")).await
    }

    async fn donor_on(options: ShardNodeOptions) -> Arc<ShardNode> {
        let routing = Arc::new(MemoryMetadataStore::new());
        let table = CollectionRouting::create(
            "app.users",
            KeyPattern::parse("uid").unwrap(),
            vec![Chunk::new(KeyRange::full(), "shard-a")],
        )
        .unwrap();
        routing.compare_and_swap("app.users", None, &table).unwrap();

        let node = ShardNode::open(
            options,
            routing,
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(ShardDirectory::new()),
        )
        .unwrap();
        node.create_physical_collection("app.users", CollectionOptions::default())
            .await
            .unwrap();
        for i in 0..20 {
            node.insert("app.users", 1, doc(json!({"_id": format!("{:02}", i), "uid": i})))
                .await
                .unwrap();
        }
        node
    }

    fn instruction(op: OperationId) -> DonorInstruction {
        DonorInstruction {
            operation_id: op,
            operation_type: OperationType::MoveRange,
            namespace: "app.users".into(),
            clone_timestamp: 1000,
            source_physical: "app.users".into(),
            source_key_pattern: KeyPattern::parse("uid").unwrap(),
            ranges: vec![KeyRange::new(uid(10), RangeBound::Max).unwrap()],
        }
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let node = donor_with_data().await;
        let op = OperationId::generate();
        let first = node.prepare_to_donate(instruction(op)).await.unwrap();
        assert_eq!(first.snapshot_seq, 20);
        assert_eq!(first.documents, 10);

        node.insert("app.users", 1, doc(json!({"_id": "99", "uid": 99})))
            .await
            .unwrap();
        let again = node.prepare_to_donate(instruction(op)).await.unwrap();
        assert_eq!(again, first);

        let mut wrong = instruction(op);
        wrong.clone_timestamp = 1;
        assert!(matches!(
            node.prepare_to_donate(wrong).await,
            Err(Error::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_pages_and_change_stream() {
        let node = donor_with_data().await;
        let op = OperationId::generate();
        let snap = node.prepare_to_donate(instruction(op)).await.unwrap();

        let first = node.fetch_snapshot_batch(op, None, 4).await.unwrap();
        assert_eq!(first.documents.len(), 4);
        assert!(!first.done);
        let last_id = first.documents[3]["_id"].as_str().unwrap().to_string();
        let rest = node.fetch_snapshot_batch(op, Some(last_id), 100).await.unwrap();
        assert_eq!(rest.documents.len(), 6);
        assert!(rest.done);

        // One write inside the donated range, one outside
        node.insert("app.users", 1, doc(json!({"_id": "50", "uid": 50})))
            .await
            .unwrap();
        node.insert("app.users", 1, doc(json!({"_id": "x", "uid": 3})))
            .await
            .unwrap();

        let changes = node.fetch_changes(op, snap.snapshot_seq, 100).await.unwrap();
        assert_eq!(changes.mutations.len(), 1);
        assert_eq!(changes.scanned_through, 22);
        assert_eq!(changes.latest_seq, 22);
        assert!(changes.oldest_pending_at.is_none());

        let report = node.report(op, Role::Donor).await.unwrap().unwrap();
        assert_eq!(report.donor().unwrap().state, DonorState::DonatingOplogEntries);
    }

    #[tokio::test]
    async fn test_critical_section_fence_point_and_abort() {
        let node = donor_with_data().await;
        let op = OperationId::generate();
        node.prepare_to_donate(instruction(op)).await.unwrap();
        node.fetch_changes(op, 20, 10).await.unwrap();

        let fence = node.enter_critical_section(op, 5).await.unwrap();
        assert_eq!(fence, 20);
        assert_eq!(node.enter_critical_section(op, 5).await.unwrap(), 20);
        assert!(matches!(
            node.insert("app.users", 1, doc(json!({"_id": "77", "uid": 77}))).await,
            Err(Error::MigrationInProgress { fence_token: 5, .. })
        ));

        node.abort(op, Role::Donor).await.unwrap();
        assert_eq!(node.fence_outcome(5).await.unwrap(), FenceOutcome::Retry);
        node.insert("app.users", 1, doc(json!({"_id": "77", "uid": 77})))
            .await
            .unwrap();
        // Aborting never touches the donor's data
        assert_eq!(node.find("app.users", 1).await.unwrap().len(), 21);
        assert!(node.commit(op, Role::Donor).await.is_err());
    }

    #[tokio::test]
    async fn test_exit_is_a_noop_when_never_entered() {
        let node = donor_with_data().await;
        let op = OperationId::generate();
        node.exit_critical_section(op).await.unwrap();
        node.prepare_to_donate(instruction(op)).await.unwrap();
        node.exit_critical_section(op).await.unwrap();
        let report = node.report(op, Role::Donor).await.unwrap().unwrap();
        assert_eq!(report.donor().unwrap().state, DonorState::DonatingInitialData);
    }

    #[tokio::test]
    async fn test_commit_drops_moved_range() {
        let node = donor_with_data().await;
        let op = OperationId::generate();
        node.prepare_to_donate(instruction(op)).await.unwrap();
        node.fetch_changes(op, 20, 10).await.unwrap();
        node.enter_critical_section(op, 3).await.unwrap();

        node.commit(op, Role::Donor).await.unwrap();
        node.commit(op, Role::Donor).await.unwrap();
        assert_eq!(node.fence_outcome(3).await.unwrap(), FenceOutcome::Moved);
        assert_eq!(node.raw_documents("app.users").len(), 10);
        assert!(!node.guard().is_blocked("app.users"));

        node.forget(op, Role::Donor).await.unwrap();
        assert!(node.report(op, Role::Donor).await.unwrap().is_none());
        assert_eq!(node.fence_outcome(3).await.unwrap(), FenceOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_snapshot_write_failure_moves_donor_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = ShardNodeOptions::new("shard-a");
        options.data_dir = Some(dir.path().to_path_buf());
        let node = donor_on(options).await;

        // Snapshots can no longer be written
        let snapshots = dir.path().join("snapshots");
        std::fs::remove_dir_all(&snapshots).unwrap();
        std::fs::write(&snapshots, b"not a directory").unwrap();

        let op = OperationId::generate();
        let err = node.prepare_to_donate(instruction(op)).await.unwrap_err();
        assert!(matches!(err, Error::ParticipantFailed { ref shard, .. } if shard == "shard-a"));

        let report = node.report(op, Role::Donor).await.unwrap().unwrap();
        assert_eq!(report.donor().unwrap().state, DonorState::Error);
        assert!(report.error.is_some());
        // Later calls keep reporting the failure instead of retrying
        assert!(matches!(
            node.prepare_to_donate(instruction(op)).await,
            Err(Error::ParticipantFailed { .. })
        ));

        node.abort(op, Role::Donor).await.unwrap();
        let report = node.report(op, Role::Donor).await.unwrap().unwrap();
        assert_eq!(report.donor().unwrap().state, DonorState::Done);
        assert_eq!(node.find("app.users", 1).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_lost_snapshot_moves_donor_to_error() {
        let node = donor_with_data().await;
        let op = OperationId::generate();
        node.prepare_to_donate(instruction(op)).await.unwrap();
        node.drop_snapshot(&op).unwrap();

        let err = node.fetch_snapshot_batch(op, None, 4).await.unwrap_err();
        assert!(matches!(err, Error::ParticipantFailed { .. }));
        let report = node.report(op, Role::Donor).await.unwrap().unwrap();
        assert_eq!(report.donor().unwrap().state, DonorState::Error);
        assert!(node.fetch_changes(op, 20, 10).await.is_err());
    }
}
