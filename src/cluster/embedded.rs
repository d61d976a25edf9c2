//! Several nodes in one process, wired through a shared [`LocalTransport`].
//!
//! Nodes join one after another the way real members do: a new node admits the
//! current members, then every current member admits it, which moves partitions
//! onto it. Killing a node disconnects it first, so the others see a crash.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::context::ClusterContext;
use crate::config::GridConfig;
use crate::error::GridResult;
use crate::membership::service::MembershipService;
use crate::membership::types::{Node, NodeId};
use crate::transport::{InboundHandler, LocalTransport};

const CP_GROUP_SIZE: usize = 3;
const BASE_PORT: u16 = 17_000;

pub struct LocalCluster {
    config: GridConfig,
    transport: Arc<LocalTransport>,
    nodes: Vec<Arc<ClusterContext>>,
    spawned: usize,
}

impl LocalCluster {
    /// Starts `size` nodes named `node-01`, `node-02`, ... An empty
    /// `cp.members` is filled with the first three of them.
    pub async fn start(size: usize, mut config: GridConfig) -> GridResult<Self> {
        if config.cp.members.is_empty() {
            config.cp.members = (1..=size.clamp(1, CP_GROUP_SIZE)).map(node_id).collect();
        }
        let mut cluster = Self {
            config,
            transport: LocalTransport::new(),
            nodes: Vec::new(),
            spawned: 0,
        };
        for _ in 0..size {
            cluster.add_node().await?;
        }
        Ok(cluster)
    }

    pub async fn add_node(&mut self) -> GridResult<Arc<ClusterContext>> {
        self.spawned += 1;
        let id = node_id(self.spawned);
        let addr = SocketAddr::from(([127, 0, 0, 1], BASE_PORT + self.spawned as u16));
        let membership =
            MembershipService::detached(Node::new(id.clone(), addr), &self.config.cluster_name);
        for existing in &self.nodes {
            membership.admit(existing.membership().local_node.clone());
        }

        let context =
            ClusterContext::join(self.config.clone(), membership.clone(), self.transport.clone())
                .await?;
        let handler: Arc<dyn InboundHandler> = context.clone();
        self.transport.register(&handler);

        for existing in &self.nodes {
            existing.membership().admit(membership.local_node.clone());
        }
        self.nodes.push(context.clone());
        Ok(context)
    }

    /// Crashes `id`: it becomes unreachable, stops, and every other node declares
    /// it dead.
    pub async fn kill_node(&mut self, id: &NodeId) -> Option<Arc<ClusterContext>> {
        let position = self.nodes.iter().position(|n| n.local_id() == id)?;
        let node = self.nodes.remove(position);
        self.transport.disconnect(id);
        node.leave().await;
        for other in &self.nodes {
            other.membership().mark_dead(id);
        }
        tracing::info!("Killed {}", id);
        Some(node)
    }

    pub fn nodes(&self) -> &[Arc<ClusterContext>] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<ClusterContext>> {
        self.nodes.iter().find(|n| n.local_id() == id)
    }

    /// Any live node.
    pub fn first(&self) -> Option<&Arc<ClusterContext>> {
        self.nodes.first()
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Waits until every node holds the same settled table: each partition owned by
    /// a live node, a full set of backups and no migration in flight.
    pub async fn await_stable(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_stable() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn is_stable(&self) -> bool {
        let Some(master) = self.nodes.iter().min_by(|a, b| a.local_id().cmp(b.local_id())) else {
            return true;
        };
        let table = master.table();
        if table.version == 0
            || table.membership_version != master.membership().current_version()
        {
            return false;
        }
        let live: Vec<NodeId> = self.nodes.iter().map(|n| n.local_id().clone()).collect();
        let backups = master
            .director()
            .backup_count()
            .min(live.len().saturating_sub(1));
        if table.check_invariants(&live, backups).is_err() {
            return false;
        }
        let settled = table
            .assignments
            .iter()
            .all(|a| a.incoming.is_empty() && a.backups.len() == backups);
        settled
            && self
                .nodes
                .iter()
                .all(|n| n.table().version == table.version)
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.leave().await;
        }
    }
}

fn node_id(index: usize) -> NodeId {
    NodeId::from(format!("node-{:02}", index).as_str())
}
