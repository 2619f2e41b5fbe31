//! # rangeshift
//!
//! Live range migration and resharding for a range-partitioned document
//! store:
//! - move one key range from its owning shard to another
//! - reshard a whole collection onto a new shard key
//! - clone at a fixed snapshot, tail the donors' change logs, fence writes
//!   in a short critical section and switch routing atomically
//! - resumable from persisted operation and participant documents
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │         Coordinator          │
//!            │  operation documents (Rocks) │
//!            │  routing tables, epoch CAS   │
//!            └──────┬───────────────┬───────┘
//!       prepare /   │               │  clone / apply /
//!       fence       │               │  commit
//!          ┌────────▼───┐       ┌───▼────────┐
//!          │  Donor     │──────▶│ Recipient  │
//!          │  shard     │ snap- │ shard      │
//!          │  + change  │ shot, │ + applier  │
//!          │    log     │ oplog │            │
//!          └────────────┘       └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! rangeshift-coord serve --bind 127.0.0.1:7070 --db ./coord-data --shards shard-a,shard-b
//!
//! rangeshift shard-collection app.users --key uid
//! rangeshift move-range app.users --min 100 --max '$max' --to shard-b --wait
//! rangeshift reshard app.users --key region,uid
//! rangeshift status <operation-id>
//! rangeshift abort --namespace app.users
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod coordinator;
pub mod ops;
pub mod shard;

pub use cluster::LocalCluster;
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, CoordinatorService};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
