//! Distributed FIFO queue.
//!
//! A queue lives in the partition of its name. The owner appends offers with the
//! partition sequence number and replicates them like any other mutation; a poll
//! replicates the removal of the exact item it took.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use crate::cluster::gateway::GridClient;
use crate::error::GridResult;
use crate::storage::container::PartitionContainer;
use crate::storage::types::{Operation, OperationResult, PartitionOp, QueueOperation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub seq: u64,
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueLog {
    pub items: VecDeque<QueueItem>,
    /// Highest offer sequence applied; replays at or below it are ignored.
    pub last_seq: u64,
}

impl QueueLog {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn head(&self) -> Option<&QueueItem> {
        self.items.front()
    }

    pub(crate) fn apply_offer(&mut self, seq: u64, value: Value) {
        if seq <= self.last_seq {
            return;
        }
        self.last_seq = seq;
        self.items.push_back(QueueItem { seq, value });
    }

    pub(crate) fn apply_poll(&mut self, item_seq: u64) {
        if self.items.front().is_some_and(|item| item.seq == item_seq) {
            self.items.pop_front();
        } else if let Some(pos) = self.items.iter().position(|item| item.seq == item_seq) {
            self.items.remove(pos);
        }
    }
}

/// Runs a queue operation at the partition owner.
pub(crate) fn execute(
    container: &PartitionContainer,
    queue: &str,
    op: &QueueOperation,
    max_size: usize,
) -> GridResult<(OperationResult, Vec<PartitionOp>)> {
    let log = container.queue(queue)?;
    let len = log.map(|l| l.len()).unwrap_or(0);

    let outcome = match op {
        QueueOperation::Offer { item } => {
            if max_size > 0 && len >= max_size {
                tracing::debug!("Queue '{}' is full ({} items)", queue, len);
                (OperationResult::Bool(false), Vec::new())
            } else {
                (
                    OperationResult::Bool(true),
                    vec![PartitionOp::QueueOffer {
                        queue: queue.to_string(),
                        item: item.clone(),
                    }],
                )
            }
        }
        QueueOperation::Poll => match log.and_then(|l| l.head()) {
            Some(head) => (
                OperationResult::Value(Some(head.value.clone())),
                vec![PartitionOp::QueuePoll {
                    queue: queue.to_string(),
                    item_seq: head.seq,
                }],
            ),
            None => (OperationResult::Value(None), Vec::new()),
        },
        QueueOperation::Peek => (
            OperationResult::Value(log.and_then(|l| l.head()).map(|h| h.value.clone())),
            Vec::new(),
        ),
        QueueOperation::Size => (OperationResult::Size(len), Vec::new()),
    };
    Ok(outcome)
}

/// Client handle for a named queue.
#[derive(Clone)]
pub struct DistributedQueue {
    name: String,
    client: GridClient,
}

impl DistributedQueue {
    pub fn new(name: &str, client: GridClient) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, op: QueueOperation) -> GridResult<OperationResult> {
        self.client
            .invoke(Operation::Queue {
                queue: self.name.clone(),
                op,
            })
            .await
    }

    /// Appends an item. `false` when the queue is at capacity.
    pub async fn offer(&self, item: Value) -> GridResult<bool> {
        self.call(QueueOperation::Offer { item }).await?.into_bool()
    }

    /// Removes and returns the head; `None` when empty.
    pub async fn poll(&self) -> GridResult<Option<Value>> {
        self.call(QueueOperation::Poll).await?.into_value()
    }

    pub async fn peek(&self) -> GridResult<Option<Value>> {
        self.call(QueueOperation::Peek).await?.into_value()
    }

    pub async fn size(&self) -> GridResult<usize> {
        self.call(QueueOperation::Size).await?.into_size()
    }
}
