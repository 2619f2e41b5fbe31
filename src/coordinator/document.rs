//! Durable operation and participant documents
//!
//! Every actor's state is a tagged enum persisted after each transition.
//! Progress is always recomputed from these documents, never from
//! in-memory flags.

use crate::common::keys::{KeyPattern, KeyRange};
use crate::common::{timestamp_now_millis, OperationError};
use crate::coordinator::routing::Chunk;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ShardId = String;

/// Opaque operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn generate() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(OperationId)
            .map_err(|e| crate::Error::InvalidOptions(format!("invalid operation id {}: {}", s, e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    MoveRange,
    Reshard,
}

/// Coordinator state.
///
/// Happy path: `Initializing → Cloning → Applying → MonitoringCommit →
/// BlockingWrites → Committing → Committed → Done`.
/// Abort path: any state before `Committing` → `Aborting → Aborted → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Initializing,
    Cloning,
    Applying,
    MonitoringCommit,
    BlockingWrites,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Done,
}

impl OperationState {
    /// Strictly before the point of no return
    pub fn is_abortable(self) -> bool {
        matches!(
            self,
            OperationState::Initializing
                | OperationState::Cloning
                | OperationState::Applying
                | OperationState::MonitoringCommit
                | OperationState::BlockingWrites
        )
    }

    pub fn is_abort_path(self) -> bool {
        matches!(self, OperationState::Aborting | OperationState::Aborted)
    }

    /// Committed, Aborted or Done
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Committed | OperationState::Aborted | OperationState::Done
        )
    }

    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            (Initializing, Cloning)
            | (Cloning, Applying)
            | (Applying, MonitoringCommit)
            | (MonitoringCommit, BlockingWrites)
            | (BlockingWrites, Committing)
            | (Committing, Committed)
            | (Committed, Done)
            | (Aborting, Aborted)
            | (Aborted, Done) => true,
            (from, Aborting) => from.is_abortable(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Initializing => "initializing",
            OperationState::Cloning => "cloning",
            OperationState::Applying => "applying",
            OperationState::MonitoringCommit => "monitoring_commit",
            OperationState::BlockingWrites => "blocking_writes",
            OperationState::Committing => "committing",
            OperationState::Committed => "committed",
            OperationState::Aborting => "aborting",
            OperationState::Aborted => "aborted",
            OperationState::Done => "done",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Donor's initial-copy point, returned by `prepare_to_donate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub shard_id: ShardId,
    pub clone_timestamp: u64,
    /// Last change-log sequence number included in the snapshot.
    /// Streaming starts strictly after it.
    pub snapshot_seq: u64,
    pub documents: u64,
}

/// Terminal outcome of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    Aborted { reason: OperationError },
}

/// One per in-flight migration/reshard. Owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDocument {
    pub operation_id: OperationId,
    pub namespace: String,
    pub operation_type: OperationType,
    pub state: OperationState,

    pub donor_shards: BTreeSet<ShardId>,
    pub recipient_shards: BTreeSet<ShardId>,

    pub source_key_pattern: KeyPattern,
    pub destination_key_pattern: KeyPattern,
    /// Source-key range being donated (full range for a reshard)
    pub source_range: KeyRange,
    /// Destination ownership installed at commit
    pub destination_chunks: Vec<Chunk>,
    pub source_physical: String,
    pub destination_physical: String,

    /// Fixed once at creation; every participant must report against it
    pub clone_timestamp: u64,
    /// Routing epoch observed at start; the commit CAS expects it
    pub routing_epoch: u64,
    pub force_redistribution: bool,

    pub donor_snapshots: BTreeMap<ShardId, SnapshotDescriptor>,
    pub fence_token: Option<u64>,
    /// Per-donor final sequence number taken after the guard was granted
    pub fence_points: BTreeMap<ShardId, u64>,
    pub critical_section_attempts: u32,
    pub critical_section_started_at: Option<u64>,
    pub critical_section_expires_at: Option<u64>,

    pub abort_reason: Option<OperationError>,
    /// First failed contact per participant, cleared on success
    pub unreachable_since: BTreeMap<ShardId, u64>,

    pub phase_started_at: BTreeMap<OperationState, u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl OperationDocument {
    /// Apply a state transition, enforcing the monotonic path rules
    pub fn transition(&mut self, next: OperationState) -> crate::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(crate::Error::InvariantViolation(format!(
                "operation {}: illegal transition {} -> {}",
                self.operation_id, self.state, next
            )));
        }
        let now = timestamp_now_millis();
        self.state = next;
        self.phase_started_at.insert(next, now);
        self.updated_at = now;
        Ok(())
    }

    /// Enter `Aborting` with a structured reason
    pub fn begin_abort(&mut self, reason: OperationError) -> crate::Result<()> {
        self.transition(OperationState::Aborting)?;
        self.abort_reason = Some(reason);
        Ok(())
    }

    pub fn participants(&self) -> BTreeSet<ShardId> {
        self.donor_shards
            .union(&self.recipient_shards)
            .cloned()
            .collect()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            OperationState::Committed => Some(Outcome::Committed),
            OperationState::Aborted => Some(Outcome::Aborted {
                reason: self.abort_reason.clone().unwrap_or_else(|| {
                    OperationError::user_abort("aborted without a recorded reason")
                }),
            }),
            OperationState::Done => match &self.abort_reason {
                Some(reason) => Some(Outcome::Aborted {
                    reason: reason.clone(),
                }),
                None => Some(Outcome::Committed),
            },
            _ => None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = if self.state == OperationState::Done {
            self.updated_at
        } else {
            timestamp_now_millis()
        };
        end.saturating_sub(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Donor,
    Recipient,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Donor => write!(f, "donor"),
            Role::Recipient => write!(f, "recipient"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonorState {
    AwaitingStart,
    DonatingInitialData,
    DonatingOplogEntries,
    PreparingToBlockWrites,
    BlockingWrites,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientState {
    AwaitingStart,
    CreatingCollection,
    Cloning,
    Applying,
    StrictConsistency,
    Done,
    Error,
}

/// How a participant finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantOutcome {
    Committed,
    Aborted,
}

/// Donor-side progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorDocument {
    pub state: DonorState,
    pub operation_type: OperationType,
    pub source_physical: String,
    pub source_key_pattern: KeyPattern,
    /// Source-key ranges donated by this shard
    pub ranges: Vec<KeyRange>,
    pub snapshot_seq: Option<u64>,
    pub documents_to_copy: u64,
    pub fence_token: Option<u64>,
    /// Last sequence number written before the guard took effect
    pub final_seq: Option<u64>,
}

/// Per-donor cursor kept by a recipient
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorCursor {
    pub snapshot_seq: u64,
    pub documents_to_copy: u64,
    /// Resume point for the initial copy: last `_id` examined
    pub last_cloned_id: Option<String>,
    /// Snapshot documents examined so far, kept or not
    pub documents_scanned: u64,
    pub clone_done: bool,
    /// Highest donor sequence number applied; replays at or below are skipped
    pub last_applied_seq: u64,
    /// Final fence point once the donor entered its critical section
    pub fence_seq: Option<u64>,
}

/// Recipient-side progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientDocument {
    pub state: RecipientState,
    pub operation_type: OperationType,
    pub destination_physical: String,
    pub destination_key_pattern: KeyPattern,
    /// Destination-key ranges this shard will own
    pub ranges: Vec<KeyRange>,
    pub collection_created: bool,
    pub donors: BTreeMap<ShardId, DonorCursor>,
    pub documents_copied: u64,
}

impl RecipientDocument {
    /// Advisory `bytesOrDocsRemaining` estimate for the initial copy
    pub fn documents_remaining(&self) -> u64 {
        self.donors
            .values()
            .map(|c| c.documents_to_copy.saturating_sub(c.documents_scanned))
            .sum()
    }

    pub fn clone_complete(&self) -> bool {
        !self.donors.is_empty() && self.donors.values().all(|c| c.clone_done)
    }

    /// All donors applied through their fence points
    pub fn reached_fence(&self) -> bool {
        !self.donors.is_empty()
            && self
                .donors
                .values()
                .all(|c| matches!(c.fence_seq, Some(f) if c.last_applied_seq >= f))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParticipantBody {
    Donor(DonorDocument),
    Recipient(RecipientDocument),
}

/// One per donor or recipient, keyed by operation id + role + shard id.
/// Mutated only by the owning actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDocument {
    pub operation_id: OperationId,
    pub shard_id: ShardId,
    pub namespace: String,
    pub clone_timestamp: u64,
    pub body: ParticipantBody,
    pub outcome: Option<ParticipantOutcome>,
    pub error: Option<OperationError>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ParticipantDocument {
    pub fn role(&self) -> Role {
        match self.body {
            ParticipantBody::Donor(_) => Role::Donor,
            ParticipantBody::Recipient(_) => Role::Recipient,
        }
    }

    pub fn donor(&self) -> Option<&DonorDocument> {
        match &self.body {
            ParticipantBody::Donor(d) => Some(d),
            ParticipantBody::Recipient(_) => None,
        }
    }

    pub fn recipient(&self) -> Option<&RecipientDocument> {
        match &self.body {
            ParticipantBody::Recipient(r) => Some(r),
            ParticipantBody::Donor(_) => None,
        }
    }

    pub fn donor_mut(&mut self) -> Option<&mut DonorDocument> {
        match &mut self.body {
            ParticipantBody::Donor(d) => Some(d),
            ParticipantBody::Recipient(_) => None,
        }
    }

    pub fn recipient_mut(&mut self) -> Option<&mut RecipientDocument> {
        match &mut self.body {
            ParticipantBody::Recipient(r) => Some(r),
            ParticipantBody::Donor(_) => None,
        }
    }

    pub fn state_name(&self) -> String {
        let raw = match &self.body {
            ParticipantBody::Donor(d) => serde_json::to_value(d.state),
            ParticipantBody::Recipient(r) => serde_json::to_value(r.state),
        };
        raw.ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn is_done(&self) -> bool {
        match &self.body {
            ParticipantBody::Donor(d) => d.state == DonorState::Done,
            ParticipantBody::Recipient(r) => r.state == RecipientState::Done,
        }
    }

    pub fn is_error(&self) -> bool {
        match &self.body {
            ParticipantBody::Donor(d) => d.state == DonorState::Error,
            ParticipantBody::Recipient(r) => r.state == RecipientState::Error,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = timestamp_now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            Initializing,
            Cloning,
            Applying,
            MonitoringCommit,
            BlockingWrites,
            Committing,
            Committed,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(!Cloning.can_transition_to(MonitoringCommit));
        assert!(!Committed.can_transition_to(Committing));
    }

    #[test]
    fn test_abort_only_before_commit_point() {
        for s in [Initializing, Cloning, Applying, MonitoringCommit, BlockingWrites] {
            assert!(s.can_transition_to(Aborting));
        }
        for s in [Committing, Committed, Aborting, Aborted, Done] {
            assert!(!s.can_transition_to(Aborting));
        }
    }

    #[test]
    fn test_no_happy_path_after_abort() {
        for s in [
            Cloning,
            Applying,
            MonitoringCommit,
            BlockingWrites,
            Committing,
            Committed,
        ] {
            assert!(!Aborting.can_transition_to(s));
            assert!(!Aborted.can_transition_to(s));
        }
        assert!(Aborting.can_transition_to(Aborted));
        assert!(Aborted.can_transition_to(Done));
    }

    #[test]
    fn test_recipient_fence_check() {
        let mut doc = RecipientDocument {
            state: RecipientState::Applying,
            operation_type: OperationType::MoveRange,
            destination_physical: "app.users".into(),
            destination_key_pattern: KeyPattern::parse("uid").unwrap(),
            ranges: vec![KeyRange::full()],
            collection_created: true,
            donors: BTreeMap::new(),
            documents_copied: 0,
        };
        assert!(!doc.reached_fence());
        doc.donors.insert(
            "a".into(),
            DonorCursor {
                last_applied_seq: 10,
                fence_seq: Some(12),
                ..Default::default()
            },
        );
        assert!(!doc.reached_fence());
        doc.donors.get_mut("a").unwrap().last_applied_seq = 12;
        assert!(doc.reached_fence());
    }

    #[test]
    fn test_operation_id_parse() {
        let id = OperationId::generate();
        let parsed: OperationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("nope".parse::<OperationId>().is_err());
    }
}
