//! Inter-node Transport
//!
//! Every call one node makes on another goes through [`ClusterTransport`]. The
//! receiving side implements [`InboundHandler`] (the node's `ClusterContext`).
//!
//! ## Implementations
//! - **`LocalTransport`**: in-process registry of handlers. Used by embedded clusters
//!   and tests; a node can be disconnected to simulate a crash.
//! - **`HttpTransport`**: JSON over HTTP (reqwest), served by the axum routes in
//!   `protocol`, with bounded retries and jittered exponential backoff.

use async_trait::async_trait;

use crate::cp::{CpRequest, CpResponse, RaftMessage};
use crate::error::GridResult;
use crate::membership::types::NodeId;
use crate::partition::{PartitionId, PartitionTable};
use crate::primitives::topic::TopicMessage;
use crate::storage::types::{Invocation, OpRecord, OperationResult, PartitionSnapshot};

pub mod http;
pub mod local;
pub mod protocol;

pub use http::HttpTransport;
pub use local::LocalTransport;

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Runs an operation at `target`, which must own the partition. Retries of one
    /// client call reuse the invocation, so the owner applies it at most once.
    async fn invoke(&self, target: &NodeId, invocation: Invocation) -> GridResult<OperationResult>;

    /// Ships an op record to a backup.
    async fn replicate(&self, target: &NodeId, record: OpRecord) -> GridResult<()>;

    async fn begin_migration(&self, target: &NodeId, partition: PartitionId) -> GridResult<()>;

    async fn fetch_snapshot(
        &self,
        target: &NodeId,
        partition: PartitionId,
    ) -> GridResult<PartitionSnapshot>;

    async fn install_snapshot(&self, target: &NodeId, snapshot: PartitionSnapshot) -> GridResult<()>;

    /// Pushes a table; returns the version installed at the target afterwards.
    async fn publish_table(&self, target: &NodeId, table: PartitionTable) -> GridResult<u64>;

    async fn deliver_topic(&self, target: &NodeId, message: TopicMessage) -> GridResult<()>;

    async fn send_raft(&self, target: &NodeId, message: RaftMessage) -> GridResult<()>;

    async fn cp_request(&self, target: &NodeId, request: CpRequest) -> GridResult<CpResponse>;
}

/// The receiving side of [`ClusterTransport`].
#[async_trait]
pub trait InboundHandler: Send + Sync {
    fn node_id(&self) -> &NodeId;

    async fn on_invoke(&self, invocation: Invocation) -> GridResult<OperationResult>;

    async fn on_replicate(&self, record: OpRecord) -> GridResult<()>;

    async fn on_begin_migration(&self, partition: PartitionId) -> GridResult<()>;

    async fn on_fetch_snapshot(&self, partition: PartitionId) -> GridResult<PartitionSnapshot>;

    async fn on_install_snapshot(&self, snapshot: PartitionSnapshot) -> GridResult<()>;

    async fn on_publish_table(&self, table: PartitionTable) -> GridResult<u64>;

    async fn on_deliver_topic(&self, message: TopicMessage) -> GridResult<()>;

    async fn on_raft(&self, message: RaftMessage) -> GridResult<()>;

    async fn on_cp_request(&self, request: CpRequest) -> GridResult<CpResponse>;
}
