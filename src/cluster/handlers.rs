//! Client HTTP routes served by the node binary.
//!
//! Every handler replies with `(StatusCode, Json)`: the operation's value on
//! success, `{"error": ...}` with a status derived from the `GridError` otherwise.

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use super::context::ClusterContext;
use crate::cp::SessionId;
use crate::cp::raft::RaftRole;
use crate::error::{GridError, GridResult};
use crate::executor::types::TaskId;
use crate::membership::types::NodeId;

type Reply = (StatusCode, Json<Value>);
type Context = Extension<Arc<ClusterContext>>;

pub fn status_of(error: &GridError) -> StatusCode {
    match error {
        GridError::NotOwner { .. }
        | GridError::PartitionUnavailable { .. }
        | GridError::ConsensusUnavailable
        | GridError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        GridError::ReplicationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GridError::NotOwnerOfLock { .. } | GridError::WrongPrimitive { .. } => {
            StatusCode::CONFLICT
        }
        GridError::Rejected { .. } => StatusCode::TOO_MANY_REQUESTS,
        GridError::UnknownProcessor(_) | GridError::UnknownHandler(_) => StatusCode::BAD_REQUEST,
        GridError::Transport { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: Serialize>(result: GridResult<T>) -> Reply {
    match result.and_then(|body| serde_json::to_value(body).map_err(GridError::from)) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => {
            tracing::warn!("Request failed: {}", e);
            (status_of(&e), Json(json!({ "error": e.to_string() })))
        }
    }
}

// --- Data Transfer Objects ---

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub value: Value,
    /// Per-entry TTL; 0 disables expiry, absent uses the map's default.
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PutIfAbsentRequest {
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub item: Value,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct RetainedQuery {
    #[serde(default)]
    pub after: u64,
}

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub session: SessionId,
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub session: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub handler: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct CpStatusResponse {
    pub node: NodeId,
    pub members: Vec<NodeId>,
    pub role: Option<RaftRole>,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
}

// --- Maps ---

async fn handle_map_get(Extension(ctx): Context, Path((map, key)): Path<(String, String)>) -> Reply {
    reply(ctx.map(&map).get_entry(&key).await)
}

async fn handle_map_put(
    Extension(ctx): Context,
    Path((map, key)): Path<(String, String)>,
    Json(req): Json<PutRequest>,
) -> Reply {
    let map = ctx.map(&map);
    let previous = match req.ttl_ms {
        Some(ttl) => map.put_with_ttl(&key, req.value, Duration::from_millis(ttl)).await,
        None => map.put(&key, req.value).await,
    };
    reply(previous.map(|previous| json!({ "previous": previous })))
}

async fn handle_map_remove(
    Extension(ctx): Context,
    Path((map, key)): Path<(String, String)>,
) -> Reply {
    let removed = ctx.map(&map).remove(&key).await;
    reply(removed.map(|removed| json!({ "removed": removed })))
}

async fn handle_map_put_if_absent(
    Extension(ctx): Context,
    Path((map, key)): Path<(String, String)>,
    Json(req): Json<PutIfAbsentRequest>,
) -> Reply {
    let existing = ctx.map(&map).put_if_absent(&key, req.value).await;
    reply(existing.map(|existing| json!({ "existing": existing })))
}

async fn handle_map_size(Extension(ctx): Context, Path(map): Path<String>) -> Reply {
    reply(ctx.map(&map).size().await.map(|size| json!({ "size": size })))
}

// --- Queues ---

async fn handle_queue_offer(
    Extension(ctx): Context,
    Path(queue): Path<String>,
    Json(req): Json<OfferRequest>,
) -> Reply {
    let accepted = ctx.queue(&queue).offer(req.item).await;
    reply(accepted.map(|accepted| json!({ "accepted": accepted })))
}

async fn handle_queue_poll(Extension(ctx): Context, Path(queue): Path<String>) -> Reply {
    reply(ctx.queue(&queue).poll().await.map(|item| json!({ "item": item })))
}

async fn handle_queue_peek(Extension(ctx): Context, Path(queue): Path<String>) -> Reply {
    reply(ctx.queue(&queue).peek().await.map(|item| json!({ "item": item })))
}

async fn handle_queue_size(Extension(ctx): Context, Path(queue): Path<String>) -> Reply {
    reply(ctx.queue(&queue).size().await.map(|size| json!({ "size": size })))
}

// --- Topics ---

async fn handle_topic_publish(
    Extension(ctx): Context,
    Path(topic): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Reply {
    let sequence = ctx.topic(&topic).publish(req.payload).await;
    reply(sequence.map(|sequence| json!({ "sequence": sequence })))
}

async fn handle_topic_retained(
    Extension(ctx): Context,
    Path(topic): Path<String>,
    Query(query): Query<RetainedQuery>,
) -> Reply {
    reply(ctx.topic(&topic).retained(query.after).await)
}

// --- Sessions & Locks ---

async fn handle_create_session(Extension(ctx): Context) -> Reply {
    let session = ctx.cp().create_session().await;
    reply(session.map(|session| json!({ "session": session })))
}

async fn handle_heartbeat(Extension(ctx): Context, Path(session): Path<SessionId>) -> Reply {
    let alive = ctx.cp().heartbeat(&session).await;
    reply(alive.map(|alive| json!({ "alive": alive })))
}

async fn handle_lock_acquire(
    Extension(ctx): Context,
    Path(lock): Path<String>,
    Json(req): Json<AcquireRequest>,
) -> Reply {
    let acquired = ctx
        .cp()
        .try_lock(&lock, &req.session, Duration::from_millis(req.timeout_ms))
        .await;
    reply(acquired.map(|acquired| json!({ "acquired": acquired })))
}

async fn handle_lock_release(
    Extension(ctx): Context,
    Path(lock): Path<String>,
    Json(req): Json<ReleaseRequest>,
) -> Reply {
    reply(ctx.cp().unlock(&lock, &req.session).await.map(|()| json!({ "released": true })))
}

async fn handle_lock_state(Extension(ctx): Context, Path(lock): Path<String>) -> Reply {
    reply(ctx.cp().lock_state(&lock).await)
}

// --- Executors ---

async fn handle_submit_task(
    Extension(ctx): Context,
    Path(executor): Path<String>,
    Json(req): Json<SubmitTaskRequest>,
) -> Reply {
    let task_id = ctx.executor(&executor).submit(&req.handler, req.payload).await;
    if let Ok(id) = &task_id {
        tracing::info!(executor = %executor, "Task submitted: {}", id);
    }
    reply(task_id.map(|task_id| json!({ "task_id": task_id })))
}

async fn handle_task_result(
    Extension(ctx): Context,
    Path((executor, task_id)): Path<(String, String)>,
) -> Reply {
    reply(ctx.executor(&executor).result(&TaskId(task_id)).await)
}

// --- Cluster ---

async fn handle_members(Extension(ctx): Context) -> Reply {
    reply(Ok(ctx.membership().get_alive_members()))
}

async fn handle_partitions(Extension(ctx): Context) -> Reply {
    reply(Ok(ctx.table().as_ref().clone()))
}

async fn handle_cp_status(Extension(ctx): Context) -> Reply {
    let status = ctx.cp().status();
    reply(Ok(CpStatusResponse {
        node: ctx.local_id().clone(),
        members: ctx.cp().members().to_vec(),
        role: ctx.cp().is_member().then_some(status.role),
        term: status.term,
        leader: status.leader,
        commit_index: status.commit_index,
    }))
}

/// The client routes of one node.
pub fn client_routes(context: Arc<ClusterContext>) -> Router {
    Router::new()
        .route("/maps/:map/size", get(handle_map_size))
        .route(
            "/maps/:map/entries/:key",
            get(handle_map_get).put(handle_map_put).delete(handle_map_remove),
        )
        .route("/maps/:map/entries/:key/put-if-absent", put(handle_map_put_if_absent))
        .route("/queues/:queue/offer", post(handle_queue_offer))
        .route("/queues/:queue/poll", post(handle_queue_poll))
        .route("/queues/:queue/peek", get(handle_queue_peek))
        .route("/queues/:queue/size", get(handle_queue_size))
        .route("/topics/:topic/publish", post(handle_topic_publish))
        .route("/topics/:topic/retained", get(handle_topic_retained))
        .route("/sessions", post(handle_create_session))
        .route("/sessions/:session/heartbeat", post(handle_heartbeat))
        .route("/locks/:lock", get(handle_lock_state))
        .route("/locks/:lock/acquire", post(handle_lock_acquire))
        .route("/locks/:lock/release", post(handle_lock_release))
        .route("/executors/:executor/tasks", post(handle_submit_task))
        .route("/executors/:executor/tasks/:task_id", get(handle_task_result))
        .route("/cluster/members", get(handle_members))
        .route("/cluster/partitions", get(handle_partitions))
        .route("/cluster/cp", get(handle_cp_status))
        .layer(Extension(context))
}
