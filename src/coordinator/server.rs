//! Coordinator server

use crate::cluster::LocalCluster;
use crate::common::{Config, Result};
use crate::coordinator::http::{create_router, AdminState};
use crate::ops::cleanup::spawn_cleanup_loop;

pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open the cluster, resume unfinished operations and serve the admin
    /// API until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let coordinator = &self.config.coordinator;
        tracing::info!(node_id = %self.config.node_id, "starting coordinator");
        tracing::info!(bind_addr = %coordinator.bind_addr, "admin API");
        match &coordinator.db_path {
            Some(path) => tracing::info!(db_path = %path.display(), "persistent metadata"),
            None => tracing::warn!("no db_path configured, metadata is in memory"),
        }
        tracing::info!(shards = ?self.config.cluster.shards, "hosting shards");

        let cluster = LocalCluster::open(&self.config)?;
        cluster.start()?;

        let cleanup = spawn_cleanup_loop(
            cluster.documents.clone(),
            coordinator.advance_interval().max(std::time::Duration::from_secs(1)),
            coordinator.quiesce_period(),
        );

        let router = create_router(AdminState {
            service: cluster.service.clone(),
            router: cluster.router.clone(),
        });
        let listener = tokio::net::TcpListener::bind(coordinator.bind_addr).await?;
        tracing::info!("coordinator ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("shutdown requested");
            })
            .await;

        cleanup.abort();
        cluster.shutdown();
        if let Err(e) = served {
            tracing::error!(error = %e, "admin API server error");
            return Err(e.into());
        }
        Ok(())
    }
}
