//! Shard side of a migration
//!
//! Each shard hosts physical collections with a change log, a critical
//! section guard and the donor/recipient actors for every operation it
//! participates in.

pub mod applier;
pub mod change_log;
pub mod client;
pub mod collection;
pub mod critical_section;
pub mod ddl;
mod donor;
pub mod node;
mod recipient;
pub mod router;

pub use client::{
    ChangeBatch, DonorInstruction, RecipientInstruction, RecipientLag, ShardClient,
    ShardDirectory, SnapshotBatch,
};
pub use collection::{Collection, CollectionOptions};
pub use critical_section::{CriticalSectionGuard, FenceOutcome};
pub use node::{ShardNode, ShardNodeOptions};
pub use router::Router;
