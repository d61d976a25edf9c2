//! Requests forwarded to the leader of the coordination group.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::lock::{CpCommand, LockOutcome, LockState, SessionId};
use crate::membership::types::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpRequest {
    /// Replicate a command and return its outcome once committed. The leader stops
    /// waiting for the commit after `wait_ms` and releases a lock acquired late.
    Propose { command: CpCommand, wait_ms: u64 },
    Heartbeat { session: SessionId },
    LockState { lock: String },
}

impl CpRequest {
    /// The same request with the commit wait capped at `budget`.
    pub fn bounded_by(self, budget: Duration) -> Self {
        match self {
            CpRequest::Propose { command, wait_ms } => CpRequest::Propose {
                command,
                wait_ms: wait_ms.min(budget.as_millis() as u64),
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpResponse {
    Outcome(LockOutcome),
    /// Whether the session is still alive.
    Heartbeat(bool),
    LockState(LockState),
    /// The receiver is not the leader; retry at `leader` if known.
    NotLeader { leader: Option<NodeId> },
}
