use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique identifier for a task within the cluster.
///
/// Wrapper around a UUID string. It is also the key of the task's record in the
/// executor's results map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskStatus {
    /// Queued, not yet taken by a worker.
    Pending,
    /// Taken by a worker on `assigned_to`.
    Running,
    Completed,
    /// The handler returned an error. A task lost with its worker stays `Running`.
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

/// The unit of work carried by the executor's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Name of the handler to run, registered on every node.
    pub handler: String,
    pub payload: Value,
    pub submitted_at_ms: u64,
}

/// What `result(task_id)` reads back: status and outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub handler: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub assigned_to: Option<NodeId>,
    pub submitted_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

impl TaskRecord {
    pub fn pending(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            handler: task.handler.clone(),
            status: TaskStatus::Pending,
            result: None,
            assigned_to: None,
            submitted_at_ms: task.submitted_at_ms,
            finished_at_ms: None,
        }
    }
}
