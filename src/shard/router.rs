//! Epoch-validating client router
//!
//! Caches routing tables and sends every request with the cached epoch.
//! A shard answering `StaleRoutingEpoch` or `StaleRoute` makes the router
//! refetch and retry. A write rejected by a critical section backs off and
//! asks the shard how that guard episode ended: `Moved` means the range
//! changed owner and the route is refetched, anything else retries in place.

use crate::common::keys::{document_id, Document};
use crate::coordinator::metadata::RoutingStore;
use crate::coordinator::routing::CollectionRouting;
use crate::shard::client::{ShardClient, ShardDirectory};
use crate::shard::critical_section::FenceOutcome;
use crate::{Error, Result};
use futures_util::future::try_join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const DEFAULT_ATTEMPTS: usize = 200;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(5);

pub struct Router {
    routing: Arc<dyn RoutingStore>,
    directory: Arc<ShardDirectory>,
    cache: RwLock<HashMap<String, CollectionRouting>>,
    max_attempts: usize,
    backoff: Duration,
}

impl Router {
    pub fn new(routing: Arc<dyn RoutingStore>, directory: Arc<ShardDirectory>) -> Self {
        Self {
            routing,
            directory,
            cache: RwLock::new(HashMap::new()),
            max_attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_retry(mut self, max_attempts: usize, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Cached table, fetched on first use
    pub fn routing(&self, namespace: &str) -> Result<CollectionRouting> {
        if let Some(routing) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(namespace)
        {
            return Ok(routing.clone());
        }
        self.refresh(namespace)
    }

    pub fn refresh(&self, namespace: &str) -> Result<CollectionRouting> {
        let routing = self
            .routing
            .get_routing(namespace)?
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        tracing::debug!(namespace, epoch = routing.epoch, "routing refreshed");
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(namespace.to_string(), routing.clone());
        Ok(routing)
    }

    pub fn invalidate(&self, namespace: &str) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(namespace);
    }

    /// Decide what to do about a failed attempt. Returns the error if it
    /// should not be retried.
    async fn recover(
        &self,
        namespace: &str,
        client: Option<&Arc<dyn ShardClient>>,
        error: Error,
        attempt: usize,
    ) -> Result<()> {
        if attempt + 1 >= self.max_attempts {
            return Err(error);
        }
        match error {
            Error::StaleRoutingEpoch { .. } | Error::StaleRoute { .. } => {
                self.refresh(namespace)?;
                Ok(())
            }
            Error::MigrationInProgress { fence_token, .. } => {
                tokio::time::sleep(self.backoff).await;
                if let Some(client) = client {
                    if client.fence_outcome(fence_token).await? == FenceOutcome::Moved {
                        self.refresh(namespace)?;
                    }
                }
                Ok(())
            }
            e if e.is_retryable() => {
                tracing::debug!(namespace, attempt, error = %e, "retrying routed request");
                tokio::time::sleep(self.backoff).await;
                Ok(())
            }
            e => Err(e),
        }
    }

    /// Send a single-document write to the owner of `doc`'s shard key
    async fn route_write<T, F, Fut>(&self, namespace: &str, doc: &Document, send: F) -> Result<T>
    where
        F: Fn(Arc<dyn ShardClient>, u64) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let routing = self.routing(namespace)?;
            let owner = routing.owner_of_document(doc)?;
            let client = self.directory.get(owner)?;
            match send(client.clone(), routing.epoch).await {
                Ok(out) => return Ok(out),
                Err(e) => self.recover(namespace, Some(&client), e, attempt).await?,
            }
            attempt += 1;
        }
    }

    pub async fn insert(&self, namespace: &str, doc: Document) -> Result<()> {
        self.route_write(namespace, &doc, |client, epoch| {
            let doc = doc.clone();
            async move { client.insert(namespace, epoch, doc).await }
        })
        .await
    }

    /// Replace a document. Its shard key must not change.
    pub async fn update(&self, namespace: &str, doc: Document) -> Result<()> {
        self.route_write(namespace, &doc, |client, epoch| {
            let doc = doc.clone();
            async move { client.update(namespace, epoch, doc).await }
        })
        .await
    }

    /// Delete by `_id`, broadcast to every shard in the table
    pub async fn delete(&self, namespace: &str, id: &str) -> Result<bool> {
        let mut attempt = 0;
        loop {
            let routing = self.routing(namespace)?;
            let mut deleted = false;
            let mut failure = None;
            for shard in routing.shards() {
                let client = self.directory.get(&shard)?;
                match client.delete(namespace, routing.epoch, id).await {
                    Ok(hit) => deleted |= hit,
                    Err(e) => {
                        failure = Some((client, e));
                        break;
                    }
                }
            }
            match failure {
                None => return Ok(deleted),
                Some((client, e)) => self.recover(namespace, Some(&client), e, attempt).await?,
            }
            attempt += 1;
        }
    }

    /// Every owned document, gathered from all shards, in `_id` order
    pub async fn find_all(&self, namespace: &str) -> Result<Vec<Document>> {
        let mut attempt = 0;
        loop {
            let routing = self.routing(namespace)?;
            let clients = routing
                .shards()
                .iter()
                .map(|shard| self.directory.get(shard))
                .collect::<Result<Vec<_>>>()?;
            let gathered = try_join_all(
                clients
                    .iter()
                    .map(|client| client.find(namespace, routing.epoch)),
            )
            .await;
            match gathered {
                Ok(parts) => {
                    let mut docs: Vec<Document> = parts.into_iter().flatten().collect();
                    docs.sort_by_cached_key(|d| document_id(d).unwrap_or_default());
                    return Ok(docs);
                }
                Err(e) => self.recover(namespace, None, e, attempt).await?,
            }
            attempt += 1;
        }
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<Option<Document>> {
        let mut attempt = 0;
        loop {
            let routing = self.routing(namespace)?;
            let clients = routing
                .shards()
                .iter()
                .map(|shard| self.directory.get(shard))
                .collect::<Result<Vec<_>>>()?;
            let gathered = try_join_all(
                clients
                    .iter()
                    .map(|client| client.get(namespace, routing.epoch, id)),
            )
            .await;
            match gathered {
                Ok(parts) => return Ok(parts.into_iter().flatten().next()),
                Err(e) => self.recover(namespace, None, e, attempt).await?,
            }
            attempt += 1;
        }
    }
}
