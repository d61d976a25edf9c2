use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::container::PartitionContainer;
use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;
use crate::partition::PartitionId;
use crate::primitives::topic::TopicMessage;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One key of a distributed map.
///
/// `version` is the partition sequence number of the write that produced the entry.
/// `last_access` and `hits` are node-local statistics used for eviction; they are
/// not replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub created_at_ms: u64,
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub last_access: u64,
    #[serde(default)]
    pub hits: u64,
}

impl Entry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl_ms
            .is_some_and(|ttl| now_ms.saturating_sub(self.created_at_ms) > ttl)
    }

    pub fn view(&self) -> EntryView {
        EntryView {
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            created_at_ms: self.created_at_ms,
            ttl_ms: self.ttl_ms,
            hits: self.hits,
        }
    }
}

/// Read-only copy of an entry handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryView {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub created_at_ms: u64,
    pub ttl_ms: Option<u64>,
    pub hits: u64,
}

/// The effect of a mutation, as shipped to backups and written to the WAL.
///
/// Applying an op is idempotent given its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionOp {
    MapPut {
        map: String,
        key: String,
        value: Value,
        ttl_ms: Option<u64>,
        created_at_ms: u64,
    },
    MapRemove {
        map: String,
        key: String,
    },
    /// Expiry and eviction removals.
    MapEvict {
        map: String,
        keys: Vec<String>,
    },
    QueueOffer {
        queue: String,
        item: Value,
    },
    QueuePoll {
        queue: String,
        item_seq: u64,
    },
    TopicPublish {
        topic: String,
        message: TopicMessage,
        retention: usize,
    },
    /// Closes a batch produced by a client request, so a retry of the same request
    /// is answered with `result` instead of running again.
    RecordRequest {
        request_id: RequestId,
        result: OperationResult,
    },
}

/// An op-log record: the unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    pub partition: PartitionId,
    pub seq: u64,
    pub op: PartitionOp,
}

/// Full copy of a partition, taken at sequence `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub partition: PartitionId,
    pub seq: u64,
    pub container: PartitionContainer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapOperation {
    /// Returns the previous value.
    Put {
        value: Value,
        /// Overrides the map TTL; `Some(0)` disables expiry for this entry.
        ttl_ms: Option<u64>,
    },
    Get,
    GetEntry,
    Remove,
    /// Returns the existing value, or `None` if the put happened.
    PutIfAbsent {
        value: Value,
        ttl_ms: Option<u64>,
    },
    Replace {
        expected: Value,
        value: Value,
    },
    ReplaceIfVersion {
        version: u64,
        value: Value,
    },
    ContainsKey,
    ExecuteOnEntry {
        processor: String,
        argument: Value,
    },
}

impl MapOperation {
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            MapOperation::Get | MapOperation::GetEntry | MapOperation::ContainsKey
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueOperation {
    Offer { item: Value },
    Poll,
    Peek,
    Size,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TopicOperation {
    /// Sequenced by the partition owner (globally ordered topics).
    Publish {
        payload: Value,
        publisher: NodeId,
        published_at_ms: u64,
    },
    /// Retained messages with a sequence above `after`.
    Retained { after: u64 },
}

/// Identifies one client call across its retries.
pub type RequestId = String;

/// An operation on its way to the owner. Every retry of one client call carries the
/// same `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub request_id: Option<RequestId>,
    pub operation: Operation,
}

impl Invocation {
    /// An invocation with a fresh request id.
    pub fn new(operation: Operation) -> Self {
        Self {
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            operation,
        }
    }

    /// An invocation that is not deduplicated.
    pub fn untracked(operation: Operation) -> Self {
        Self {
            request_id: None,
            operation,
        }
    }
}

/// A request the gateway submits to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Map {
        map: String,
        key: String,
        op: MapOperation,
    },
    Queue {
        queue: String,
        op: QueueOperation,
    },
    Topic {
        topic: String,
        op: TopicOperation,
    },
    /// Live entries of `map` in the partitions the receiving node owns.
    OwnedMapSize { map: String },
    /// Runs a processor over every entry of `map` the receiving node owns.
    ExecuteOnOwnedEntries {
        map: String,
        processor: String,
        argument: Value,
    },
}

impl Operation {
    /// The key that selects the partition, `None` for node-scoped operations.
    pub fn routing_key(&self) -> Option<&str> {
        match self {
            Operation::Map { key, .. } => Some(key),
            Operation::Queue { queue, .. } => Some(queue),
            Operation::Topic { topic, .. } => Some(topic),
            Operation::OwnedMapSize { .. } | Operation::ExecuteOnOwnedEntries { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResult {
    Value(Option<Value>),
    Entry(Option<EntryView>),
    Bool(bool),
    Size(usize),
    Processed(Value),
    ProcessedMany(BTreeMap<String, Value>),
    Published { sequence: u64 },
    Messages(Vec<TopicMessage>),
}

impl OperationResult {
    fn unexpected(&self, wanted: &str) -> GridError {
        GridError::Serialization(format!("expected {} result, got {:?}", wanted, self))
    }

    pub fn into_value(self) -> GridResult<Option<Value>> {
        match self {
            OperationResult::Value(v) => Ok(v),
            other => Err(other.unexpected("value")),
        }
    }

    pub fn into_entry(self) -> GridResult<Option<EntryView>> {
        match self {
            OperationResult::Entry(v) => Ok(v),
            other => Err(other.unexpected("entry")),
        }
    }

    pub fn into_bool(self) -> GridResult<bool> {
        match self {
            OperationResult::Bool(v) => Ok(v),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn into_size(self) -> GridResult<usize> {
        match self {
            OperationResult::Size(v) => Ok(v),
            other => Err(other.unexpected("size")),
        }
    }

    pub fn into_processed(self) -> GridResult<Value> {
        match self {
            OperationResult::Processed(v) => Ok(v),
            other => Err(other.unexpected("processed")),
        }
    }

    pub fn into_processed_many(self) -> GridResult<BTreeMap<String, Value>> {
        match self {
            OperationResult::ProcessedMany(v) => Ok(v),
            other => Err(other.unexpected("processed entries")),
        }
    }

    pub fn into_sequence(self) -> GridResult<u64> {
        match self {
            OperationResult::Published { sequence } => Ok(sequence),
            other => Err(other.unexpected("published")),
        }
    }

    pub fn into_messages(self) -> GridResult<Vec<TopicMessage>> {
        match self {
            OperationResult::Messages(v) => Ok(v),
            other => Err(other.unexpected("messages")),
        }
    }
}
