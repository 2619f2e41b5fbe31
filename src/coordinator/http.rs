//! Admin and data-plane HTTP API of the coordinator
//!
//! Operations:
//! - `POST /collections` shard a collection
//! - `POST /operations/move-range`, `POST /operations/reshard` start an operation
//! - `POST /operations/abort` abort by operation id or namespace
//! - `GET /operations`, `GET /operations/:id`, `GET /operations/:id/wait`
//!
//! Routing and data:
//! - `GET /routing`, `GET /routing/:ns`
//! - `GET|POST|PUT /collections/:ns/documents`, `GET|DELETE /collections/:ns/documents/:id`
//!
//! Ops: `GET /health`, `GET /metrics`, `GET /verify/:ns`
//!
//! Errors are `{"ok": false, "error": <message>, "kind": <error kind>}` with
//! the status of [`Error::to_http_status`].

use crate::common::keys::{Document, KeyPattern, KeyRange, RangeBound};
use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::coordinator::document::{OperationDocument, OperationId};
use crate::coordinator::routing::{Chunk, CollectionRouting};
use crate::coordinator::service::{
    CoordinatorService, MoveRangeRequest, ReshardRequest, ShardCollectionRequest,
};
use crate::ops::verify::{verify_namespace, VerifyReport};
use crate::shard::collection::CollectionOptions;
use crate::shard::router::Router as QueryRouter;
use crate::Error;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Longest a `/wait` request may block
const MAX_WAIT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<CoordinatorService>,
    pub router: Arc<QueryRouter>,
}

#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        (
            status,
            Json(json!({
                "ok": false,
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ChunkBody {
    #[serde(default)]
    min: Value,
    #[serde(default)]
    max: Value,
    shard: String,
}

impl ChunkBody {
    fn into_chunk(self) -> crate::Result<Chunk> {
        Ok(Chunk::new(parse_range(&self.min, &self.max)?, self.shard))
    }
}

fn parse_range(min: &Value, max: &Value) -> crate::Result<KeyRange> {
    KeyRange::new(
        RangeBound::from_json(min, RangeBound::Min)?,
        RangeBound::from_json(max, RangeBound::Max)?,
    )
}

fn parse_chunks(chunks: Option<Vec<ChunkBody>>) -> crate::Result<Option<Vec<Chunk>>> {
    chunks
        .map(|chunks| chunks.into_iter().map(ChunkBody::into_chunk).collect())
        .transpose()
}

fn chunk_json(chunk: &Chunk) -> Value {
    json!({
        "min": chunk.range.min.to_json(),
        "max": chunk.range.max.to_json(),
        "shard": chunk.shard,
    })
}

fn routing_json(routing: &CollectionRouting) -> Value {
    json!({
        "namespace": routing.namespace,
        "physical": routing.physical,
        "key": routing.key_pattern.fields(),
        "epoch": routing.epoch,
        "chunks": routing.chunks.iter().map(chunk_json).collect::<Vec<_>>(),
        "options": routing.options,
        "last_operation": routing.last_operation,
        "updated_at": routing.updated_at,
    })
}

fn operation_summary(doc: &OperationDocument) -> Value {
    json!({
        "operation_id": doc.operation_id,
        "namespace": doc.namespace,
        "operation_type": doc.operation_type,
        "state": doc.state,
        "donors": doc.donor_shards,
        "recipients": doc.recipient_shards,
        "elapsed_ms": doc.elapsed_ms(),
        "outcome": doc.outcome(),
    })
}

#[derive(Debug, Deserialize)]
struct ShardCollectionBody {
    namespace: String,
    /// Comma-separated key fields
    key: String,
    #[serde(default)]
    chunks: Option<Vec<ChunkBody>>,
    #[serde(default)]
    options: CollectionOptions,
}

#[derive(Debug, Deserialize)]
struct MoveRangeBody {
    namespace: String,
    #[serde(default)]
    min: Value,
    #[serde(default)]
    max: Value,
    to_shard: String,
}

#[derive(Debug, Deserialize)]
struct ReshardBody {
    namespace: String,
    key: String,
    #[serde(default)]
    chunks: Option<Vec<ChunkBody>>,
    #[serde(default)]
    force_redistribution: bool,
}

#[derive(Debug, Deserialize)]
struct AbortBody {
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default = "default_abort_reason")]
    reason: String,
}

fn default_abort_reason() -> String {
    "aborted by operator".to_string()
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout_ms: Option<u64>,
}

async fn shard_collection(
    State(state): State<AdminState>,
    Json(body): Json<ShardCollectionBody>,
) -> ApiResult<impl IntoResponse> {
    let routing = state
        .service
        .shard_collection(ShardCollectionRequest {
            namespace: body.namespace,
            key_pattern: KeyPattern::parse(&body.key)?,
            chunks: parse_chunks(body.chunks)?,
            options: body.options,
        })
        .await?;
    state.router.invalidate(&routing.namespace);
    Ok((StatusCode::CREATED, Json(routing_json(&routing))))
}

async fn move_range(
    State(state): State<AdminState>,
    Json(body): Json<MoveRangeBody>,
) -> ApiResult<impl IntoResponse> {
    let started = state
        .service
        .start_range_migration(MoveRangeRequest {
            namespace: body.namespace,
            range: parse_range(&body.min, &body.max)?,
            to_shard: body.to_shard,
        })
        .await?;
    let status = if started.noop {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(started)))
}

async fn reshard(
    State(state): State<AdminState>,
    Json(body): Json<ReshardBody>,
) -> ApiResult<impl IntoResponse> {
    let started = state
        .service
        .start_reshard(ReshardRequest {
            namespace: body.namespace,
            new_key_pattern: KeyPattern::parse(&body.key)?,
            chunks: parse_chunks(body.chunks)?,
            force_redistribution: body.force_redistribution,
        })
        .await?;
    let status = if started.noop {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(started)))
}

async fn abort(
    State(state): State<AdminState>,
    Json(body): Json<AbortBody>,
) -> ApiResult<Json<Value>> {
    let id = match (body.operation_id, body.namespace) {
        (Some(id), _) => {
            let id: OperationId = id.parse()?;
            state.service.request_abort(id, &body.reason).await?;
            id
        }
        (None, Some(namespace)) => {
            state
                .service
                .request_abort_namespace(&namespace, &body.reason)
                .await?
        }
        (None, None) => {
            return Err(Error::InvalidOptions(
                "abort needs an operation_id or a namespace".into(),
            )
            .into())
        }
    };
    Ok(Json(json!({ "ok": true, "operation_id": id })))
}

async fn list_operations(State(state): State<AdminState>) -> ApiResult<Json<Value>> {
    let ops = state.service.list()?;
    Ok(Json(json!({
        "operations": ops.iter().map(operation_summary).collect::<Vec<_>>(),
    })))
}

async fn operation_status(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id: OperationId = id.parse()?;
    Ok(Json(state.service.status(id).await?))
}

async fn wait_operation(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Json<Value>> {
    let id: OperationId = id.parse()?;
    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(MAX_WAIT)
        .min(MAX_WAIT);
    let outcome = state.service.wait_for_completion(id, Some(timeout)).await?;
    Ok(Json(json!({ "ok": true, "operation_id": id, "outcome": outcome })))
}

async fn list_routing(State(state): State<AdminState>) -> ApiResult<Json<Value>> {
    let tables = state.service.routing_store().list_routing()?;
    Ok(Json(json!({
        "collections": tables.iter().map(routing_json).collect::<Vec<_>>(),
    })))
}

async fn get_routing(
    State(state): State<AdminState>,
    Path(namespace): Path<String>,
) -> ApiResult<Json<Value>> {
    let routing = state.router.refresh(&namespace)?;
    Ok(Json(routing_json(&routing)))
}

async fn find_documents(
    State(state): State<AdminState>,
    Path(namespace): Path<String>,
) -> ApiResult<Json<Value>> {
    let docs = state.router.find_all(&namespace).await?;
    Ok(Json(json!({ "count": docs.len(), "documents": docs })))
}

async fn insert_document(
    State(state): State<AdminState>,
    Path(namespace): Path<String>,
    Json(doc): Json<Document>,
) -> ApiResult<impl IntoResponse> {
    state.router.insert(&namespace, doc).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true }))))
}

async fn update_document(
    State(state): State<AdminState>,
    Path(namespace): Path<String>,
    Json(doc): Json<Document>,
) -> ApiResult<Json<Value>> {
    state.router.update(&namespace, doc).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_document(
    State(state): State<AdminState>,
    Path((namespace, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    match state.router.get(&namespace, &id).await? {
        Some(doc) => Ok(Json(Value::Object(doc))),
        None => Err(Error::NotFound(format!("document {} in {}", id, namespace)).into()),
    }
}

async fn delete_document(
    State(state): State<AdminState>,
    Path((namespace, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let deleted = state.router.delete(&namespace, &id).await?;
    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

async fn verify(
    State(state): State<AdminState>,
    Path(namespace): Path<String>,
) -> ApiResult<Json<VerifyReport>> {
    let report = verify_namespace(
        state.service.routing_store().as_ref(),
        state.service.directory(),
        &namespace,
    )
    .await?;
    Ok(Json(report))
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "shards": state.service.directory().shard_ids(),
        "operations_in_flight": METRICS.operations_in_flight.get(),
        "uptime_seconds": METRICS.uptime_seconds(),
    }))
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/verify/:ns", get(verify))
        .route("/routing", get(list_routing))
        .route("/routing/:ns", get(get_routing))
        .route("/collections", post(shard_collection))
        .route(
            "/collections/:ns/documents",
            get(find_documents).post(insert_document).put(update_document),
        )
        .route(
            "/collections/:ns/documents/:id",
            get(get_document).delete(delete_document),
        )
        .route("/operations", get(list_operations))
        .route("/operations/move-range", post(move_range))
        .route("/operations/reshard", post(reshard))
        .route("/operations/abort", post(abort))
        .route("/operations/:id", get(operation_status))
        .route("/operations/:id/wait", get(wait_operation))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_tracing_middleware)),
        )
}
