//! Error taxonomy shared by every grid component.
//!
//! Errors cross the wire between nodes (HTTP transport, forwarded invocations), so
//! the enum is serde-serializable and carries only owned, plain data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::membership::types::NodeId;

/// Result type for grid operations.
pub type GridResult<T> = Result<T, GridError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GridError {
    /// The operation reached a node that does not own the partition.
    /// The caller must re-route, to `owner` if one is known.
    #[error("partition {partition} is not owned by this node (owner: {owner:?})")]
    NotOwner {
        partition: u32,
        owner: Option<NodeId>,
    },

    /// A synchronous backup did not acknowledge in time. The mutation was applied at
    /// the owner but its durability is uncertain.
    #[error("replication of partition {partition} seq {seq} timed out")]
    ReplicationTimeout { partition: u32, seq: u64 },

    /// A backup received a record that does not follow the last one it applied.
    /// The owner must resend the partition as a snapshot.
    #[error("partition {partition} expected seq {expected}, received {received}")]
    ReplicaGap {
        partition: u32,
        expected: u64,
        received: u64,
    },

    /// No live owner is known for the partition (membership transition).
    #[error("partition {partition} has no live owner")]
    PartitionUnavailable { partition: u32 },

    /// Unlock attempted by a session that does not hold the lock.
    #[error("session {session} does not hold lock '{lock}'")]
    NotOwnerOfLock { lock: String, session: String },

    /// The coordination group has no leader with a live quorum.
    #[error("coordination group has no quorum")]
    ConsensusUnavailable,

    #[error("transport to {node} failed: {reason}")]
    Transport { node: NodeId, reason: String },

    #[error("no entry processor registered under '{0}'")]
    UnknownProcessor(String),

    #[error("no task handler registered under '{0}'")]
    UnknownHandler(String),

    /// A name is already bound to a different primitive kind in its partition.
    #[error("'{name}' is a {existing}, not a {requested}")]
    WrongPrimitive {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("rejected: {reason}")]
    Rejected { reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("write-ahead log error: {0}")]
    Wal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("node is shutting down")]
    ShuttingDown,
}

impl GridError {
    /// Errors after which the gateway should re-route and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridError::NotOwner { .. }
                | GridError::PartitionUnavailable { .. }
                | GridError::Transport { .. }
        )
    }

    pub fn transport(node: &NodeId, reason: impl ToString) -> Self {
        GridError::Transport {
            node: node.clone(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for GridError {
    fn from(e: serde_json::Error) -> Self {
        GridError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(e: std::io::Error) -> Self {
        GridError::Wal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GridError::NotOwner {
            partition: 17,
            owner: Some(NodeId("node-b".to_string())),
        };
        assert!(err.to_string().contains("17"));
        assert!(err.to_string().contains("node-b"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GridError::PartitionUnavailable { partition: 1 }.is_retryable());
        assert!(!GridError::ConsensusUnavailable.is_retryable());
        assert!(
            !GridError::ReplicationTimeout {
                partition: 1,
                seq: 4
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_crosses_the_wire() {
        let err = GridError::NotOwnerOfLock {
            lock: "L".to_string(),
            session: "s-1".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let restored: GridError = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, err);
    }
}
