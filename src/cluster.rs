//! In-process cluster: one metadata store, a set of shard nodes and the
//! coordinator wired together

use crate::common::config::{Config, CoordinatorConfig, MigrationConfig};
use crate::coordinator::metadata::{DocumentStore, MemoryMetadataStore, RocksMetadataStore, RoutingStore};
use crate::coordinator::service::CoordinatorService;
use crate::shard::client::ShardDirectory;
use crate::shard::node::{ShardNode, ShardNodeOptions};
use crate::shard::router::Router;
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

pub struct LocalCluster {
    pub documents: Arc<dyn DocumentStore>,
    pub routing: Arc<dyn RoutingStore>,
    pub directory: Arc<ShardDirectory>,
    pub nodes: Vec<Arc<ShardNode>>,
    pub service: Arc<CoordinatorService>,
    pub router: Arc<Router>,
}

impl LocalCluster {
    /// Open the cluster described by `config`. With a `db_path` the metadata
    /// lives in RocksDB and every shard persists under `<db_path>/shards/<id>`.
    pub fn open(config: &Config) -> Result<Self> {
        match &config.coordinator.db_path {
            Some(path) => {
                let store = Arc::new(RocksMetadataStore::open(path.join("metadata"))?);
                Self::assemble(
                    store.clone(),
                    store,
                    &config.cluster.shards,
                    Some(path.join("shards")),
                    config.coordinator.clone(),
                    config.migration.clone(),
                )
            }
            None => {
                let store = Arc::new(MemoryMetadataStore::new());
                Self::assemble(
                    store.clone(),
                    store,
                    &config.cluster.shards,
                    None,
                    config.coordinator.clone(),
                    config.migration.clone(),
                )
            }
        }
    }

    /// Build a cluster over existing stores, e.g. to restart a coordinator
    /// on the metadata a previous one left behind
    pub fn assemble(
        documents: Arc<dyn DocumentStore>,
        routing: Arc<dyn RoutingStore>,
        shards: &[String],
        data_dir: Option<PathBuf>,
        coordinator: CoordinatorConfig,
        migration: MigrationConfig,
    ) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::InvalidConfig("cluster needs at least one shard".into()));
        }

        let directory = Arc::new(ShardDirectory::new());
        let mut nodes = Vec::with_capacity(shards.len());
        for id in shards {
            let mut options = ShardNodeOptions::new(id.clone());
            options.migration = migration.clone();
            options.data_dir = data_dir.as_ref().map(|d| d.join(id));
            let node = ShardNode::open(options, routing.clone(), documents.clone(), directory.clone())?;
            directory.register(node.clone());
            nodes.push(node);
        }

        let service = CoordinatorService::new(
            documents.clone(),
            routing.clone(),
            directory.clone(),
            coordinator,
            migration,
        );
        let router = Arc::new(Router::new(routing.clone(), directory.clone()));

        Ok(Self {
            documents,
            routing,
            directory,
            nodes,
            service,
            router,
        })
    }

    /// Re-attach shards and coordinator to persisted in-flight operations.
    /// Must run inside a tokio runtime.
    pub fn start(&self) -> Result<usize> {
        for node in &self.nodes {
            node.resume()?;
        }
        let resumed = self.service.resume_all()?;
        tracing::info!(
            shards = self.nodes.len(),
            resumed_operations = resumed,
            "cluster started"
        );
        Ok(resumed)
    }

    pub fn node(&self, shard_id: &str) -> Option<&Arc<ShardNode>> {
        self.nodes.iter().find(|n| n.id() == shard_id)
    }

    /// Stop background work and unregister the shards. Nodes hold the
    /// directory, so the stores are only released once they are unregistered.
    pub fn shutdown(&self) {
        self.service.shutdown();
        for node in &self.nodes {
            node.shutdown();
            self.directory.deregister(node.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persistent_cluster_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.coordinator.db_path = Some(dir.path().to_path_buf());

        {
            let cluster = LocalCluster::open(&config).unwrap();
            cluster.start().unwrap();
            cluster
                .service
                .shard_collection(crate::coordinator::service::ShardCollectionRequest {
                    namespace: "app.users".into(),
                    key_pattern: crate::common::keys::KeyPattern::parse("uid").unwrap(),
                    chunks: None,
                    options: Default::default(),
                })
                .await
                .unwrap();
            let doc = serde_json::json!({"_id": "u1", "uid": 1})
                .as_object()
                .cloned()
                .unwrap();
            cluster.router.insert("app.users", doc).await.unwrap();
            cluster.shutdown();
        }

        let cluster = LocalCluster::open(&config).unwrap();
        assert_eq!(cluster.start().unwrap(), 0);
        let found = cluster.router.get("app.users", "u1").await.unwrap();
        assert!(found.is_some());
        assert_eq!(cluster.routing.get_routing("app.users").unwrap().unwrap().epoch, 1);
    }

    #[test]
    fn test_empty_cluster_rejected() {
        let store = Arc::new(MemoryMetadataStore::new());
        let err = LocalCluster::assemble(
            store.clone(),
            store,
            &[],
            None,
            CoordinatorConfig::default(),
            MigrationConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
