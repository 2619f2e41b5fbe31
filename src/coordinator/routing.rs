//! Range ownership tables
//!
//! A [`CollectionRouting`] maps contiguous key ranges of one namespace to
//! owning shards. It is versioned by `epoch`; every change produces a new
//! table with `epoch + 1` that is installed through the routing store's
//! compare-and-swap, never edited in place.

use crate::common::keys::{Document, KeyPattern, KeyRange, RangeBound, ShardKey};
use crate::common::timestamp_now_millis;
use crate::coordinator::document::{OperationId, ShardId};
use crate::shard::collection::CollectionOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One owned range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub range: KeyRange,
    pub shard: ShardId,
}

impl Chunk {
    pub fn new(range: KeyRange, shard: impl Into<ShardId>) -> Self {
        Self {
            range,
            shard: shard.into(),
        }
    }
}

/// Routing table for one sharded namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRouting {
    pub namespace: String,
    /// Physical collection name on the shards. A reshard commit swaps it.
    pub physical: String,
    pub key_pattern: KeyPattern,
    pub epoch: u64,
    /// Sorted, contiguous, covering `[Min, Max)`
    pub chunks: Vec<Chunk>,
    /// Schema and indexes every shard creates the physical collection with
    #[serde(default)]
    pub options: CollectionOptions,
    pub last_operation: Option<OperationId>,
    pub updated_at: u64,
}

impl CollectionRouting {
    /// First routing table of a freshly sharded collection
    pub fn create(
        namespace: impl Into<String>,
        key_pattern: KeyPattern,
        chunks: Vec<Chunk>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let routing = Self {
            physical: namespace.clone(),
            namespace,
            key_pattern,
            epoch: 1,
            chunks,
            options: CollectionOptions::default(),
            last_operation: None,
            updated_at: timestamp_now_millis(),
        };
        routing.validate()?;
        Ok(routing)
    }

    pub fn with_options(mut self, options: CollectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Chunks must be sorted, contiguous and cover the whole key space
    pub fn validate(&self) -> Result<()> {
        validate_chunks(&self.chunks)?;
        self.key_pattern.validate()
    }

    pub fn owner_of(&self, key: &ShardKey) -> Option<&ShardId> {
        self.chunks
            .iter()
            .find(|c| c.range.contains(key))
            .map(|c| &c.shard)
    }

    pub fn owner_of_document(&self, doc: &Document) -> Result<&ShardId> {
        let key = self.key_pattern.extract(doc)?;
        self.owner_of(&key).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "routing for {} epoch {} has no owner for {}",
                self.namespace, self.epoch, key
            ))
        })
    }

    /// The single shard owning all of `range`, if there is one
    pub fn sole_owner_of_range(&self, range: &KeyRange) -> Option<&ShardId> {
        let mut owners = self
            .chunks
            .iter()
            .filter(|c| c.range.overlaps(range))
            .map(|c| &c.shard);
        let first = owners.next()?;
        owners.all(|s| s == first).then_some(first)
    }

    pub fn shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|c| c.shard.clone()).collect()
    }

    pub fn ranges_owned_by(&self, shard: &str) -> Vec<KeyRange> {
        self.chunks
            .iter()
            .filter(|c| c.shard == shard)
            .map(|c| c.range.clone())
            .collect()
    }

    pub fn owns(&self, shard: &str, key: &ShardKey) -> bool {
        self.owner_of(key).map(|s| s == shard).unwrap_or(false)
    }

    /// New table with `range` reassigned to `to_shard`.
    ///
    /// Chunk boundaries are split at the range edges and adjacent chunks with
    /// the same owner are merged back together.
    pub fn with_moved_range(
        &self,
        range: &KeyRange,
        to_shard: &str,
        operation_id: OperationId,
    ) -> Result<Self> {
        let mut chunks = Vec::with_capacity(self.chunks.len() + 2);
        for chunk in &self.chunks {
            if !chunk.range.overlaps(range) {
                chunks.push(chunk.clone());
                continue;
            }
            if chunk.range.min < range.min {
                chunks.push(Chunk::new(
                    KeyRange::new(chunk.range.min.clone(), range.min.clone())?,
                    chunk.shard.clone(),
                ));
            }
            let inner_min = chunk.range.min.clone().max(range.min.clone());
            let inner_max = chunk.range.max.clone().min(range.max.clone());
            chunks.push(Chunk::new(KeyRange::new(inner_min, inner_max)?, to_shard));
            if range.max < chunk.range.max {
                chunks.push(Chunk::new(
                    KeyRange::new(range.max.clone(), chunk.range.max.clone())?,
                    chunk.shard.clone(),
                ));
            }
        }

        let next = Self {
            namespace: self.namespace.clone(),
            physical: self.physical.clone(),
            key_pattern: self.key_pattern.clone(),
            epoch: self.epoch + 1,
            chunks: merge_adjacent(chunks),
            options: self.options.clone(),
            last_operation: Some(operation_id),
            updated_at: timestamp_now_millis(),
        };
        next.validate()?;
        Ok(next)
    }

    /// New table for a reshard: new key pattern, new chunks, new physical name
    pub fn with_reshard(
        &self,
        key_pattern: KeyPattern,
        chunks: Vec<Chunk>,
        physical: impl Into<String>,
        operation_id: OperationId,
    ) -> Result<Self> {
        let next = Self {
            namespace: self.namespace.clone(),
            physical: physical.into(),
            key_pattern,
            epoch: self.epoch + 1,
            chunks: merge_adjacent(chunks),
            options: self.options.clone(),
            last_operation: Some(operation_id),
            updated_at: timestamp_now_millis(),
        };
        next.validate()?;
        Ok(next)
    }

    /// True if this table is the result of committing `operation_id` on top
    /// of `base_epoch`
    pub fn committed_by(&self, operation_id: &OperationId, base_epoch: u64) -> bool {
        self.epoch == base_epoch + 1 && self.last_operation.as_ref() == Some(operation_id)
    }
}

/// Chunks must be sorted, contiguous and cover `[Min, Max)`
pub fn validate_chunks(chunks: &[Chunk]) -> Result<()> {
    let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
        return Err(Error::InvalidOptions("routing table has no chunks".into()));
    };
    if first.range.min != RangeBound::Min || last.range.max != RangeBound::Max {
        return Err(Error::InvalidOptions(
            "chunks must cover the whole key space".into(),
        ));
    }
    for pair in chunks.windows(2) {
        if pair[0].range.max != pair[1].range.min {
            return Err(Error::InvalidOptions(format!(
                "chunks {} and {} are not contiguous",
                pair[0].range, pair[1].range
            )));
        }
    }
    Ok(())
}

/// Split the key space at `split_points` and deal the pieces to `shards`
/// round-robin
pub fn chunks_from_split_points(split_points: &[ShardKey], shards: &[ShardId]) -> Result<Vec<Chunk>> {
    if shards.is_empty() {
        return Err(Error::InvalidOptions("no shards to distribute to".into()));
    }
    let mut bounds = vec![RangeBound::Min];
    let mut sorted: Vec<&ShardKey> = split_points.iter().collect();
    sorted.sort();
    sorted.dedup();
    bounds.extend(sorted.into_iter().map(|k| RangeBound::Key(k.clone())));
    bounds.push(RangeBound::Max);

    bounds
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            Ok(Chunk::new(
                KeyRange::new(pair[0].clone(), pair[1].clone())?,
                shards[i % shards.len()].clone(),
            ))
        })
        .collect()
}

fn merge_adjacent(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match merged.last_mut() {
            Some(prev) if prev.shard == chunk.shard && prev.range.max == chunk.range.min => {
                prev.range.max = chunk.range.max;
            }
            _ => merged.push(chunk),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::keys::KeyValue;

    fn key(i: i64) -> ShardKey {
        ShardKey(vec![KeyValue::Int(i)])
    }

    fn bound(i: i64) -> RangeBound {
        RangeBound::Key(key(i))
    }

    fn two_shard_table() -> CollectionRouting {
        let chunks = chunks_from_split_points(&[key(100)], &["a".into(), "b".into()]).unwrap();
        CollectionRouting::create("app.users", KeyPattern::parse("uid").unwrap(), chunks).unwrap()
    }

    #[test]
    fn test_create_and_lookup() {
        let table = two_shard_table();
        assert_eq!(table.epoch, 1);
        assert_eq!(table.owner_of(&key(5)).unwrap(), "a");
        assert_eq!(table.owner_of(&key(100)).unwrap(), "b");
        assert_eq!(table.shards().len(), 2);
    }

    #[test]
    fn test_gap_rejected() {
        let chunks = vec![
            Chunk::new(KeyRange::new(RangeBound::Min, bound(10)).unwrap(), "a"),
            Chunk::new(KeyRange::new(bound(20), RangeBound::Max).unwrap(), "b"),
        ];
        assert!(validate_chunks(&chunks).is_err());
    }

    #[test]
    fn test_move_middle_of_chunk() {
        let table = two_shard_table();
        let op = OperationId::generate();
        let range = KeyRange::new(bound(10), bound(20)).unwrap();
        let next = table.with_moved_range(&range, "b", op).unwrap();

        assert_eq!(next.epoch, 2);
        assert_eq!(next.chunks.len(), 4);
        assert_eq!(next.owner_of(&key(9)).unwrap(), "a");
        assert_eq!(next.owner_of(&key(15)).unwrap(), "b");
        assert_eq!(next.owner_of(&key(20)).unwrap(), "a");
        assert!(next.committed_by(&op, 1));
    }

    #[test]
    fn test_move_merges_adjacent_owner() {
        let table = two_shard_table();
        let range = KeyRange::new(bound(50), bound(100)).unwrap();
        let next = table
            .with_moved_range(&range, "b", OperationId::generate())
            .unwrap();
        assert_eq!(next.chunks.len(), 2);
        assert_eq!(next.chunks[1].range.min, bound(50));
    }

    #[test]
    fn test_sole_owner() {
        let table = two_shard_table();
        let inside = KeyRange::new(bound(1), bound(2)).unwrap();
        let across = KeyRange::new(bound(50), bound(150)).unwrap();
        assert_eq!(table.sole_owner_of_range(&inside).unwrap(), "a");
        assert!(table.sole_owner_of_range(&across).is_none());
    }

    #[test]
    fn test_reshard_swaps_physical() {
        let table = two_shard_table();
        let chunks = chunks_from_split_points(&[key(0)], &["b".into(), "a".into()]).unwrap();
        let next = table
            .with_reshard(
                KeyPattern::parse("region").unwrap(),
                chunks,
                "app.__reshard_users",
                OperationId::generate(),
            )
            .unwrap();
        assert_eq!(next.physical, "app.__reshard_users");
        assert_eq!(next.key_pattern.fields(), &["region".to_string()]);
        assert_eq!(next.epoch, table.epoch + 1);
    }
}
