//! Request id propagation for the admin API
//!
//! Every request gets an id, taken from `X-Request-ID` when the caller sent
//! one. The id is echoed on the response and recorded on the request span so
//! coordinator log lines emitted while serving it can be correlated.

use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

pub async fn request_tracing_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = tracing::info_span!(
        "admin_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    let mut response = next.run(request).instrument(span).await;

    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;
    if status.is_server_error() {
        tracing::warn!(%request_id, %method, %path, status = status.as_u16(), duration_ms, "request failed");
    } else if status.is_client_error() {
        tracing::debug!(%request_id, %method, %path, status = status.as_u16(), duration_ms, "request rejected");
    } else {
        tracing::debug!(%request_id, %method, %path, status = status.as_u16(), duration_ms, "request served");
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
