//! Inter-node HTTP Protocol
//!
//! Endpoints and DTOs of the internal routes that `HttpTransport` calls. Every
//! response body is a JSON `Result<T, GridError>`, so errors raised at the receiver
//! reach the caller unchanged.

use axum::{
    Json, Router,
    extract::{Extension, Path},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::InboundHandler;
use crate::cp::{CpRequest, CpResponse, RaftMessage};
use crate::error::GridError;
use crate::partition::{PartitionId, PartitionTable};
use crate::primitives::topic::TopicMessage;
use crate::storage::types::{Invocation, OpRecord, OperationResult, PartitionSnapshot};

// --- API Endpoints ---

/// Runs a partition-routed operation at its owner.
pub const ENDPOINT_INVOKE: &str = "/internal/invoke";
/// Op-log shipping from an owner to a backup.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
pub const ENDPOINT_BEGIN_MIGRATION: &str = "/internal/migration/begin";
/// GET `/internal/snapshot/:partition` fetches, POST `/internal/snapshot` installs.
pub const ENDPOINT_SNAPSHOT: &str = "/internal/snapshot";
pub const ENDPOINT_TABLE: &str = "/internal/table";
pub const ENDPOINT_TOPIC: &str = "/internal/topic";
pub const ENDPOINT_RAFT: &str = "/internal/raft";
pub const ENDPOINT_CP: &str = "/internal/cp";

// --- Data Transfer Objects ---

/// Body of every internal response.
pub type WireResult<T> = Result<T, GridError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginMigrationRequest {
    pub partition: PartitionId,
}

/// Version of the table installed at the receiver after a publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAck {
    pub version: u64,
}

type Inbound = Extension<Arc<dyn InboundHandler>>;

async fn handle_invoke(
    Extension(node): Inbound,
    Json(invocation): Json<Invocation>,
) -> Json<WireResult<OperationResult>> {
    Json(node.on_invoke(invocation).await)
}

async fn handle_replicate(Extension(node): Inbound, Json(record): Json<OpRecord>) -> Json<WireResult<()>> {
    Json(node.on_replicate(record).await)
}

async fn handle_begin_migration(
    Extension(node): Inbound,
    Json(req): Json<BeginMigrationRequest>,
) -> Json<WireResult<()>> {
    Json(node.on_begin_migration(req.partition).await)
}

async fn handle_fetch_snapshot(
    Extension(node): Inbound,
    Path(partition): Path<PartitionId>,
) -> Json<WireResult<PartitionSnapshot>> {
    Json(node.on_fetch_snapshot(partition).await)
}

async fn handle_install_snapshot(
    Extension(node): Inbound,
    Json(snapshot): Json<PartitionSnapshot>,
) -> Json<WireResult<()>> {
    Json(node.on_install_snapshot(snapshot).await)
}

async fn handle_publish_table(
    Extension(node): Inbound,
    Json(table): Json<PartitionTable>,
) -> Json<WireResult<TableAck>> {
    Json(node.on_publish_table(table).await.map(|version| TableAck { version }))
}

async fn handle_topic(Extension(node): Inbound, Json(message): Json<TopicMessage>) -> Json<WireResult<()>> {
    Json(node.on_deliver_topic(message).await)
}

async fn handle_raft(Extension(node): Inbound, Json(message): Json<RaftMessage>) -> Json<WireResult<()>> {
    Json(node.on_raft(message).await)
}

async fn handle_cp(Extension(node): Inbound, Json(request): Json<CpRequest>) -> Json<WireResult<CpResponse>> {
    Json(node.on_cp_request(request).await)
}

/// The internal routes, served by every node.
pub fn internal_routes(node: Arc<dyn InboundHandler>) -> Router {
    Router::new()
        .route(ENDPOINT_INVOKE, post(handle_invoke))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(ENDPOINT_BEGIN_MIGRATION, post(handle_begin_migration))
        .route(ENDPOINT_SNAPSHOT, post(handle_install_snapshot))
        .route("/internal/snapshot/:partition", get(handle_fetch_snapshot))
        .route(ENDPOINT_TABLE, post(handle_publish_table))
        .route(ENDPOINT_TOPIC, post(handle_topic))
        .route(ENDPOINT_RAFT, post(handle_raft))
        .route(ENDPOINT_CP, post(handle_cp))
        .layer(Extension(node))
}
