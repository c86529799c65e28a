//! Public HTTP API
//!
//! - `GET /kv/:key`     read (followers)
//! - `POST /kv/:key`    write, raw body is the value (leader)
//! - `DELETE /kv/:key`  delete (leader)
//! - `GET /health`, `GET /admin/status`, `GET /metrics`
//!
//! Errors are JSON `{ "error", "kind", "retryable" }` so a client can tell
//! "try another node" from "retry" from "do not retry".

use crate::common::{Error, METRICS};
use crate::node::Node;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<Node>,
}

/// Error response body
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "retryable": self.0.is_retryable(),
        });
        (self.0.to_http_status(), Json(body)).into_response()
    }
}

pub fn create_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/kv/:key", get(get_key).post(put_key).delete(delete_key))
        .route("/health", get(health))
        .route("/admin/status", get(admin_status))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { node })
}

async fn get_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    match state.node.get(&key)? {
        Some(value) => Ok(Json(json!({ "key": key, "value": value })).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("key not found: {}", key),
                "kind": "not_found",
                "retryable": false,
            })),
        )
            .into_response()),
    }
}

async fn put_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    value: String,
) -> Result<impl IntoResponse, ApiError> {
    let version = state.node.put(&key, value).await?;
    Ok(Json(json!({ "key": key, "version": version })))
}

async fn delete_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let version = state.node.delete(&key).await?;
    Ok(Json(json!({ "key": key, "version": version, "deleted": true })))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let election = state.node.election().state();
    let status = if election.role().is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "electing" },
            "node_id": state.node.node_id(),
            "role": election,
            "version": crate::VERSION,
        })),
    )
}

async fn admin_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.node.status().await)
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.node.status().await;
    let mut out = String::new();
    out.push_str("# HELP quorumkv_is_leader Whether this node holds the leader role\n");
    out.push_str("# TYPE quorumkv_is_leader gauge\n");
    out += &format!(
        "quorumkv_is_leader{{node_id=\"{}\"}} {}\n",
        status.node_id,
        u8::from(state.node.election().is_leader())
    );
    out.push_str("# HELP quorumkv_wal_last_committed Highest committed WAL version\n");
    out.push_str("# TYPE quorumkv_wal_last_committed gauge\n");
    out += &format!(
        "quorumkv_wal_last_committed{{node_id=\"{}\"}} {}\n",
        status.node_id, status.last_committed
    );
    out.push_str("# HELP quorumkv_wal_pending Entries appended but not committed\n");
    out.push_str("# TYPE quorumkv_wal_pending gauge\n");
    out += &format!(
        "quorumkv_wal_pending{{node_id=\"{}\"}} {}\n",
        status.node_id, status.pending
    );
    out += &METRICS.to_prometheus();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
}
