//! In-process transport for embedded clusters.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

use super::{ClusterTransport, InboundHandler};
use crate::cp::{CpRequest, CpResponse, RaftMessage};
use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;
use crate::partition::{PartitionId, PartitionTable};
use crate::primitives::topic::TopicMessage;
use crate::storage::types::{Invocation, OpRecord, OperationResult, PartitionSnapshot};

/// Routes calls to the handlers registered in the same process. Shared by every
/// node of an embedded cluster.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<NodeId, Weak<dyn InboundHandler>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, handler: &Arc<dyn InboundHandler>) {
        let id = handler.node_id().clone();
        tracing::debug!("Registered local handler for {}", id);
        self.handlers.insert(id, Arc::downgrade(handler));
    }

    /// Makes `node` unreachable, as if it crashed.
    pub fn disconnect(&self, node: &NodeId) {
        if self.handlers.remove(node).is_some() {
            tracing::info!("Disconnected {}", node);
        }
    }

    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.handlers
            .get(node)
            .is_some_and(|h| h.value().strong_count() > 0)
    }

    fn handler(&self, target: &NodeId) -> GridResult<Arc<dyn InboundHandler>> {
        self.handlers
            .get(target)
            .and_then(|h| h.value().upgrade())
            .ok_or_else(|| GridError::transport(target, "unreachable"))
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn invoke(&self, target: &NodeId, invocation: Invocation) -> GridResult<OperationResult> {
        self.handler(target)?.on_invoke(invocation).await
    }

    async fn replicate(&self, target: &NodeId, record: OpRecord) -> GridResult<()> {
        self.handler(target)?.on_replicate(record).await
    }

    async fn begin_migration(&self, target: &NodeId, partition: PartitionId) -> GridResult<()> {
        self.handler(target)?.on_begin_migration(partition).await
    }

    async fn fetch_snapshot(
        &self,
        target: &NodeId,
        partition: PartitionId,
    ) -> GridResult<PartitionSnapshot> {
        self.handler(target)?.on_fetch_snapshot(partition).await
    }

    async fn install_snapshot(&self, target: &NodeId, snapshot: PartitionSnapshot) -> GridResult<()> {
        self.handler(target)?.on_install_snapshot(snapshot).await
    }

    async fn publish_table(&self, target: &NodeId, table: PartitionTable) -> GridResult<u64> {
        self.handler(target)?.on_publish_table(table).await
    }

    async fn deliver_topic(&self, target: &NodeId, message: TopicMessage) -> GridResult<()> {
        self.handler(target)?.on_deliver_topic(message).await
    }

    async fn send_raft(&self, target: &NodeId, message: RaftMessage) -> GridResult<()> {
        self.handler(target)?.on_raft(message).await
    }

    async fn cp_request(&self, target: &NodeId, request: CpRequest) -> GridResult<CpResponse> {
        self.handler(target)?.on_cp_request(request).await
    }
}
