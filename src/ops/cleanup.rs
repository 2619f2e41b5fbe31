//! Garbage collection of finished operations
//!
//! A `Done` operation document stays readable for the quiesce period so late
//! status and wait calls still see the outcome. After that it is deleted,
//! together with any participant document still filed under it.

use crate::common::timestamp_now_millis;
use crate::coordinator::document::{OperationId, OperationState};
use crate::coordinator::metadata::DocumentStore;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub operations_removed: Vec<OperationId>,
    pub participants_removed: usize,
}

/// Delete `Done` operations finished more than `quiesce` ago
pub fn collect_finished(documents: &dyn DocumentStore, quiesce: Duration) -> Result<CleanupReport> {
    let cutoff = timestamp_now_millis().saturating_sub(quiesce.as_millis() as u64);
    let mut report = CleanupReport::default();

    let expired: HashSet<OperationId> = documents
        .list_operations()?
        .into_iter()
        .filter(|op| op.state == OperationState::Done && op.updated_at <= cutoff)
        .map(|op| op.operation_id)
        .collect();
    if expired.is_empty() {
        return Ok(report);
    }

    for participant in documents.list_participants()? {
        if expired.contains(&participant.operation_id) {
            documents.delete_participant(
                &participant.operation_id,
                participant.role(),
                &participant.shard_id,
            )?;
            report.participants_removed += 1;
        }
    }
    for id in expired {
        documents.delete_operation(&id)?;
        tracing::debug!(operation_id = %id, "finished operation collected");
        report.operations_removed.push(id);
    }

    tracing::info!(
        operations = report.operations_removed.len(),
        participants = report.participants_removed,
        "operation cleanup pass"
    );
    Ok(report)
}

/// Run [`collect_finished`] every `interval`
pub fn spawn_cleanup_loop(
    documents: Arc<dyn DocumentStore>,
    interval: Duration,
    quiesce: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = collect_finished(documents.as_ref(), quiesce) {
                tracing::warn!(error = %e, "operation cleanup failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::{KeyPattern, KeyRange};
    use crate::coordinator::document::{OperationDocument, OperationType};
    use crate::coordinator::metadata::MemoryMetadataStore;
    use crate::coordinator::routing::Chunk;
    use std::collections::BTreeSet;

    fn operation(state: OperationState, updated_at: u64) -> OperationDocument {
        OperationDocument {
            operation_id: OperationId::generate(),
            namespace: "app.users".into(),
            operation_type: OperationType::MoveRange,
            state,
            donor_shards: BTreeSet::from(["shard-a".to_string()]),
            recipient_shards: BTreeSet::from(["shard-b".to_string()]),
            source_key_pattern: KeyPattern::parse("uid").unwrap(),
            destination_key_pattern: KeyPattern::parse("uid").unwrap(),
            source_range: KeyRange::full(),
            destination_chunks: vec![Chunk::new(KeyRange::full(), "shard-b")],
            source_physical: "app.users".into(),
            destination_physical: "app.users".into(),
            clone_timestamp: 1,
            routing_epoch: 1,
            force_redistribution: false,
            donor_snapshots: Default::default(),
            fence_token: None,
            fence_points: Default::default(),
            critical_section_attempts: 0,
            critical_section_started_at: None,
            critical_section_expires_at: None,
            abort_reason: None,
            unreachable_since: Default::default(),
            phase_started_at: Default::default(),
            created_at: 1,
            updated_at,
        }
    }

    #[test]
    fn test_only_quiesced_done_operations_are_collected() {
        let store = MemoryMetadataStore::new();
        let now = timestamp_now_millis();
        let old_done = operation(OperationState::Done, 1);
        let fresh_done = operation(OperationState::Done, now);
        let running = operation(OperationState::Applying, 1);
        for op in [&old_done, &fresh_done, &running] {
            store.put_operation(op).unwrap();
        }

        let report = collect_finished(&store, Duration::from_secs(3600)).unwrap();
        assert_eq!(report.operations_removed, vec![old_done.operation_id]);
        assert!(store.get_operation(&fresh_done.operation_id).unwrap().is_some());
        assert!(store.get_operation(&running.operation_id).unwrap().is_some());

        let report = collect_finished(&store, Duration::ZERO).unwrap();
        assert_eq!(report.operations_removed, vec![fresh_done.operation_id]);
        assert_eq!(store.list_operations().unwrap().len(), 1);
    }
}
