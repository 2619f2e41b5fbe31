//! Coordinator side of a migration
//!
//! The coordinator persists one operation document per move or reshard,
//! drives donors and recipients through their state machines and switches
//! the routing table at the commit point:
//! - `document`: operation and participant documents, state enums
//! - `metadata`: durable document store and routing compare-and-swap
//! - `routing`: range ownership tables
//! - `commit_monitor`, `critical_section`: commit readiness and write fencing
//! - `service`: the coordinator itself
//! - `http`, `server`: admin API

pub mod commit_monitor;
pub mod critical_section;
pub mod document;
pub mod http;
pub mod metadata;
pub mod routing;
pub mod server;
pub mod service;

pub use document::{OperationDocument, OperationId, OperationState, OperationType, Outcome};
pub use metadata::{DocumentStore, MemoryMetadataStore, RocksMetadataStore, RoutingStore};
pub use routing::{Chunk, CollectionRouting};
pub use server::Coordinator;
pub use service::{
    CoordinatorService, MoveRangeRequest, OperationStatus, Progress, ReshardRequest,
    ShardCollectionRequest, StartResponse,
};
