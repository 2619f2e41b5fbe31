//! Ownership and consistency check of a sharded collection
//!
//! Reads every shard's owned documents at the current routing epoch and
//! checks that each document lives on exactly one shard, the one the routing
//! table assigns its shard key to.

use crate::common::keys::document_id;
use crate::coordinator::document::ShardId;
use crate::coordinator::metadata::RoutingStore;
use crate::coordinator::routing::validate_chunks;
use crate::shard::client::ShardDirectory;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub namespace: String,
    pub epoch: u64,
    pub chunks: usize,
    pub documents: usize,
    pub per_shard: BTreeMap<ShardId, usize>,
    /// `_id`s returned by more than one shard
    pub duplicates: Vec<String>,
    /// `_id`s served by a shard the routing table does not assign them to
    pub misplaced: Vec<String>,
    /// Owners named by the routing table that are not registered
    pub missing_shards: Vec<ShardId>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.duplicates.is_empty() && self.misplaced.is_empty() && self.missing_shards.is_empty()
    }
}

pub async fn verify_namespace(
    routing: &dyn RoutingStore,
    directory: &ShardDirectory,
    namespace: &str,
) -> Result<VerifyReport> {
    let table = routing
        .get_routing(namespace)?
        .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
    validate_chunks(&table.chunks)?;

    let mut report = VerifyReport {
        namespace: namespace.to_string(),
        epoch: table.epoch,
        chunks: table.chunks.len(),
        ..VerifyReport::default()
    };

    let mut seen: HashMap<String, ShardId> = HashMap::new();
    for shard in table.shards() {
        let client = match directory.get(&shard) {
            Ok(client) => client,
            Err(_) => {
                report.missing_shards.push(shard);
                continue;
            }
        };
        let docs = client.find(namespace, table.epoch).await?;
        report.per_shard.insert(shard.clone(), docs.len());
        for doc in docs {
            let id = document_id(&doc)?;
            let key = table.key_pattern.extract(&doc)?;
            if !table.owns(&shard, &key) {
                report.misplaced.push(id.clone());
            }
            if let Some(first) = seen.insert(id.clone(), shard.clone()) {
                tracing::debug!(namespace, id = %id, first = %first, second = %shard, "duplicate document");
                report.duplicates.push(id);
            }
        }
    }
    report.documents = seen.len();

    if report.is_consistent() {
        tracing::info!(
            namespace,
            epoch = report.epoch,
            documents = report.documents,
            "collection verified"
        );
    } else {
        tracing::error!(
            namespace,
            epoch = report.epoch,
            duplicates = report.duplicates.len(),
            misplaced = report.misplaced.len(),
            missing_shards = ?report.missing_shards,
            "collection failed verification"
        );
    }
    Ok(report)
}
