//! Critical section guard
//!
//! A range-scoped write block held on a donor shard while ownership of the
//! range is handed off. Reads are never blocked. Acquisition is try-only:
//! an overlapping guard held by another operation fails fast.
//!
//! The guard lock is always taken inside the shard's storage lock so that
//! the final sequence number captured at acquisition covers every write
//! that got past the guard.

use crate::common::keys::{KeyRange, ShardKey};
use crate::common::metrics::METRICS;
use crate::coordinator::document::OperationId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How a guard episode ended, as seen by a writer holding its fence token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceOutcome {
    /// Still blocking writes
    Held,
    /// Aborted; retry against the same owner
    Retry,
    /// Committed; the range moved, re-route
    Moved,
    /// Token never seen on this shard
    Unknown,
}

#[derive(Debug, Clone)]
pub struct GuardRecord {
    pub operation_id: OperationId,
    pub namespace: String,
    pub range: KeyRange,
    pub fence_token: u64,
    /// Last change-log sequence number written before the block
    pub final_seq: u64,
    pub acquired_at: Instant,
}

#[derive(Default)]
struct GuardState {
    held: HashMap<String, Vec<GuardRecord>>,
    latest_token: HashMap<String, u64>,
    /// Outcome per released token, kept until its operation is forgotten
    finished: HashMap<u64, (OperationId, FenceOutcome)>,
}

#[derive(Default)]
pub struct CriticalSectionGuard {
    state: Mutex<GuardState>,
}

impl CriticalSectionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block writes to `range`.
    ///
    /// Re-acquiring with the same operation and token returns the original
    /// final sequence number.
    pub fn try_acquire(
        &self,
        namespace: &str,
        range: &KeyRange,
        operation_id: OperationId,
        fence_token: u64,
        final_seq: u64,
    ) -> Result<u64> {
        let mut state = self.state();

        if let Some(existing) = state.held.get(namespace).and_then(|guards| {
            guards.iter().find(|g| {
                g.operation_id == operation_id && g.fence_token == fence_token && &g.range == range
            })
        }) {
            return Ok(existing.final_seq);
        }

        if let Some(holder) = state
            .held
            .get(namespace)
            .and_then(|guards| guards.iter().find(|g| g.range.overlaps(range)))
        {
            return Err(Error::CriticalSectionBusy {
                namespace: namespace.to_string(),
                holder: holder.operation_id.to_string(),
            });
        }

        // Further ranges of an episode already under way reuse its token
        let same_episode = state
            .held
            .values()
            .flatten()
            .any(|g| g.operation_id == operation_id && g.fence_token == fence_token);
        let latest = state.latest_token.get(namespace).copied().unwrap_or(0);
        if fence_token < latest || (fence_token == latest && !same_episode) {
            return Err(Error::StaleFenceToken {
                namespace: namespace.to_string(),
                token: fence_token,
                latest,
            });
        }

        state.latest_token.insert(namespace.to_string(), fence_token);
        state
            .held
            .entry(namespace.to_string())
            .or_default()
            .push(GuardRecord {
                operation_id,
                namespace: namespace.to_string(),
                range: range.clone(),
                fence_token,
                final_seq,
                acquired_at: Instant::now(),
            });

        tracing::info!(
            namespace,
            %operation_id,
            fence_token,
            final_seq,
            range = %range,
            "critical section acquired"
        );
        Ok(final_seq)
    }

    /// Reject a write whose key lies in a guarded range
    pub fn check_write(&self, namespace: &str, key: &ShardKey) -> Result<()> {
        let state = self.state();
        if let Some(guard) = state
            .held
            .get(namespace)
            .and_then(|guards| guards.iter().find(|g| g.range.contains(key)))
        {
            METRICS.record_rejected_write(namespace);
            return Err(Error::MigrationInProgress {
                namespace: namespace.to_string(),
                fence_token: guard.fence_token,
            });
        }
        Ok(())
    }

    /// Release every guard held by `operation_id`. No-op if none is held.
    pub fn release(&self, operation_id: &OperationId, committed: bool) -> Option<Duration> {
        let mut state = self.state();
        let outcome = if committed {
            FenceOutcome::Moved
        } else {
            FenceOutcome::Retry
        };

        let mut longest: Option<Duration> = None;
        let mut released = Vec::new();
        for guards in state.held.values_mut() {
            guards.retain(|g| {
                if &g.operation_id == operation_id {
                    released.push(g.fence_token);
                    let held_for = g.acquired_at.elapsed();
                    longest = Some(longest.map_or(held_for, |l| l.max(held_for)));
                    false
                } else {
                    true
                }
            });
        }
        state.held.retain(|_, guards| !guards.is_empty());
        for token in released {
            state.finished.insert(token, (*operation_id, outcome));
        }

        if let Some(held_for) = longest {
            tracing::info!(
                %operation_id,
                ?outcome,
                held_ms = held_for.as_millis() as u64,
                "critical section released"
            );
        }
        longest
    }

    /// Reinstall a guard after a restart, bypassing the staleness check
    pub fn restore(&self, record: GuardRecord) {
        let mut state = self.state();
        let latest = state
            .latest_token
            .entry(record.namespace.clone())
            .or_insert(0);
        *latest = (*latest).max(record.fence_token);
        let guards = state.held.entry(record.namespace.clone()).or_default();
        if !guards.iter().any(|g| {
            g.operation_id == record.operation_id
                && g.fence_token == record.fence_token
                && g.range == record.range
        }) {
            guards.push(record);
        }
    }

    pub fn outcome(&self, fence_token: u64) -> FenceOutcome {
        let state = self.state();
        if state
            .held
            .values()
            .flatten()
            .any(|g| g.fence_token == fence_token)
        {
            return FenceOutcome::Held;
        }
        state
            .finished
            .get(&fence_token)
            .map(|(_, outcome)| *outcome)
            .unwrap_or(FenceOutcome::Unknown)
    }

    /// Drop the recorded outcomes of `operation_id`. Its tokens report
    /// `Unknown` afterwards. Guards still held are untouched.
    pub fn forget(&self, operation_id: &OperationId) {
        self.state()
            .finished
            .retain(|_, (owner, _)| owner != operation_id);
    }

    #[cfg(test)]
    fn finished_len(&self) -> usize {
        self.state().finished.len()
    }

    pub fn held_by(&self, operation_id: &OperationId) -> Vec<GuardRecord> {
        self.state()
            .held
            .values()
            .flatten()
            .filter(|g| &g.operation_id == operation_id)
            .cloned()
            .collect()
    }

    pub fn is_blocked(&self, namespace: &str) -> bool {
        self.state()
            .held
            .get(namespace)
            .map(|g| !g.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::{KeyValue, RangeBound};

    fn key(i: i64) -> ShardKey {
        ShardKey(vec![KeyValue::Int(i)])
    }

    fn range(a: i64, b: i64) -> KeyRange {
        KeyRange::new(RangeBound::Key(key(a)), RangeBound::Key(key(b))).unwrap()
    }

    #[test]
    fn test_blocks_only_the_range() {
        let guard = CriticalSectionGuard::new();
        let op = OperationId::generate();
        guard.try_acquire("app.users", &range(0, 10), op, 1, 42).unwrap();

        let err = guard.check_write("app.users", &key(5)).unwrap_err();
        assert!(matches!(err, Error::MigrationInProgress { fence_token: 1, .. }));
        assert!(guard.check_write("app.users", &key(10)).is_ok());
        assert!(guard.check_write("app.orders", &key(5)).is_ok());
    }

    #[test]
    fn test_acquire_is_idempotent_per_token() {
        let guard = CriticalSectionGuard::new();
        let op = OperationId::generate();
        assert_eq!(guard.try_acquire("ns.c", &range(0, 10), op, 7, 100).unwrap(), 100);
        // Later sequence numbers are ignored on re-entry
        assert_eq!(guard.try_acquire("ns.c", &range(0, 10), op, 7, 150).unwrap(), 100);
    }

    #[test]
    fn test_overlap_fails_fast() {
        let guard = CriticalSectionGuard::new();
        guard
            .try_acquire("ns.c", &range(0, 10), OperationId::generate(), 1, 0)
            .unwrap();
        let err = guard
            .try_acquire("ns.c", &range(5, 15), OperationId::generate(), 2, 0)
            .unwrap_err();
        assert!(matches!(err, Error::CriticalSectionBusy { .. }));
        guard
            .try_acquire("ns.c", &range(10, 15), OperationId::generate(), 3, 0)
            .unwrap();
    }

    #[test]
    fn test_stale_token_rejected() {
        let guard = CriticalSectionGuard::new();
        let first = OperationId::generate();
        guard.try_acquire("ns.c", &range(0, 10), first, 5, 0).unwrap();
        guard.release(&first, false);

        let err = guard
            .try_acquire("ns.c", &range(0, 10), OperationId::generate(), 4, 0)
            .unwrap_err();
        assert!(matches!(err, Error::StaleFenceToken { latest: 5, .. }));
    }

    #[test]
    fn test_one_token_covers_several_ranges() {
        let guard = CriticalSectionGuard::new();
        let op = OperationId::generate();
        guard.try_acquire("ns.c", &range(0, 10), op, 3, 8).unwrap();
        guard.try_acquire("ns.c", &range(20, 30), op, 3, 8).unwrap();
        assert_eq!(guard.held_by(&op).len(), 2);

        let err = guard
            .try_acquire("ns.c", &range(40, 50), OperationId::generate(), 3, 8)
            .unwrap_err();
        assert!(matches!(err, Error::StaleFenceToken { .. }));
    }

    #[test]
    fn test_release_outcomes() {
        let guard = CriticalSectionGuard::new();
        let op = OperationId::generate();
        assert!(guard.release(&op, true).is_none());

        guard.try_acquire("ns.c", &range(0, 10), op, 9, 0).unwrap();
        assert_eq!(guard.outcome(9), FenceOutcome::Held);
        assert!(guard.release(&op, true).is_some());
        assert_eq!(guard.outcome(9), FenceOutcome::Moved);
        assert_eq!(guard.outcome(10), FenceOutcome::Unknown);
        assert!(!guard.is_blocked("ns.c"));
    }

    #[test]
    fn test_forget_prunes_released_outcomes() {
        let guard = CriticalSectionGuard::new();
        let ops: Vec<OperationId> = (0..50).map(|_| OperationId::generate()).collect();
        for (i, op) in ops.iter().enumerate() {
            let token = i as u64 + 1;
            guard.try_acquire("ns.c", &range(0, 10), *op, token, 0).unwrap();
            guard.release(op, i % 2 == 0);
        }
        assert_eq!(guard.finished_len(), 50);

        let kept = OperationId::generate();
        guard.try_acquire("ns.c", &range(0, 10), kept, 51, 0).unwrap();
        for op in &ops {
            guard.forget(op);
        }
        guard.forget(&kept);

        assert_eq!(guard.finished_len(), 0);
        assert_eq!(guard.outcome(1), FenceOutcome::Unknown);
        assert_eq!(guard.outcome(51), FenceOutcome::Held);
        assert!(guard.is_blocked("ns.c"));
    }
}
