//! Change stream applier
//!
//! Applies a donor's mutations to the recipient's destination collection in
//! donor order. Each mutation carries the donor's sequence number; anything
//! at or below the recipient's persisted high-water mark is skipped, so a
//! replayed segment is a no-op.
//!
//! Placement is decided by the destination key of the post-image, never by
//! where the document currently sits: a document updated out of this
//! recipient's ranges is removed, one updated into them is upserted.

use crate::common::keys::{document_id, Document, KeyPattern, KeyRange};
use crate::common::metrics::METRICS;
use crate::shard::change_log::{Mutation, MutationOp};
use crate::shard::collection::{in_ranges, Collection};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// New high-water mark
    pub last_applied: u64,
    pub applied: u64,
    pub skipped: u64,
}

pub struct ChangeApplier {
    pattern: KeyPattern,
    ranges: Vec<KeyRange>,
}

impl ChangeApplier {
    pub fn new(pattern: KeyPattern, ranges: Vec<KeyRange>) -> Self {
        Self { pattern, ranges }
    }

    /// Does the document belong to this recipient after the operation?
    ///
    /// A document without a valid destination key fails the whole batch:
    /// no recipient would take it, and the donor drops its copy at commit.
    pub fn owns(&self, doc: &Document) -> Result<bool> {
        in_ranges(&self.pattern, &self.ranges, doc)
    }

    /// Copy a batch of snapshot documents. Returns how many were kept.
    pub fn apply_snapshot(&self, collection: &mut Collection, docs: &[Document]) -> Result<u64> {
        let mut copied = 0;
        for doc in docs {
            if self.owns(doc)? {
                collection.upsert(doc.clone())?;
                copied += 1;
            }
        }
        METRICS.documents_cloned.add(copied);
        Ok(copied)
    }

    /// Apply mutations in order, skipping those at or below `last_applied`
    pub fn apply(
        &self,
        collection: &mut Collection,
        last_applied: u64,
        batch: &[Mutation],
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome {
            last_applied,
            ..Default::default()
        };

        for mutation in batch {
            if mutation.seq <= outcome.last_applied {
                outcome.skipped += 1;
                continue;
            }
            self.apply_one(collection, mutation)?;
            outcome.last_applied = mutation.seq;
            outcome.applied += 1;
        }

        METRICS.mutations_applied.add(outcome.applied);
        METRICS.mutations_skipped.add(outcome.skipped);
        Ok(outcome)
    }

    fn apply_one(&self, collection: &mut Collection, mutation: &Mutation) -> Result<()> {
        match &mutation.op {
            MutationOp::Insert(doc) | MutationOp::Update(doc) => {
                if self.owns(doc)? {
                    collection.upsert(doc.clone()).map_err(|e| match e {
                        Error::SchemaValidation(msg) => Error::SchemaValidation(format!(
                            "applying donor mutation {}: {}",
                            mutation.seq, msg
                        )),
                        other => other,
                    })?;
                } else {
                    collection.remove(&document_id(doc)?)?;
                }
            }
            MutationOp::Delete(doc) => {
                collection.remove(&document_id(doc)?)?;
            }
        }
        Ok(())
    }
}
