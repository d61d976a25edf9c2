use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// Represents a single member in the cluster.
///
/// Contains identity, network addressing, and current lifecycle state.
/// The `incarnation` field is a logical clock used to order updates and resolve conflicts
/// (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    /// A fresh, alive node. The HTTP port sits 1000 above the gossip port.
    pub fn new(id: NodeId, gossip_addr: SocketAddr) -> Self {
        let http_addr = SocketAddr::new(
            gossip_addr.ip(),
            gossip_addr.port().wrapping_add(1000),
        );
        Self {
            id,
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }
}

/// The wire protocol for inter-node gossip.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: Disseminates changes in node health.
/// - `Leave`: Graceful departure, skips the suspect/dead timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        cluster_name: String,
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
    },
}

/// Published on every join or leave seen by the local membership service.
///
/// `version` increases by one per event; consumers must apply events in version
/// order and drop any event older than the last one they applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub version: u64,
    /// Live node ids, sorted.
    pub live_nodes: Vec<NodeId>,
}
