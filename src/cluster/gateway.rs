//! Client-side routing.
//!
//! [`GridClient`] sends every operation to the owner of its partition as this node
//! sees it. A `NotOwner`, `PartitionUnavailable` or transport failure means the
//! table is moving; the call is re-routed under the newer table after a jittered
//! exponential backoff. Every attempt of one call carries the same request id, so an
//! owner that already applied it answers from its request log.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::context::ClusterContext;
use crate::cp::CpService;
use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;
use crate::storage::types::{Invocation, Operation, OperationResult};

const INVOKE_ATTEMPTS: usize = 8;
const BACKOFF_BASE_MS: u64 = 150;
const BACKOFF_MAX_MS: u64 = 1200;

#[derive(Clone)]
pub struct GridClient {
    context: Arc<ClusterContext>,
}

impl GridClient {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        Self { context }
    }

    pub fn local_id(&self) -> &NodeId {
        self.context.local_id()
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub fn cp(&self) -> &Arc<CpService> {
        self.context.cp()
    }

    async fn send(&self, target: &NodeId, invocation: Invocation) -> GridResult<OperationResult> {
        if target == self.context.local_id() {
            self.context.submit_invocation(invocation).await
        } else {
            self.context.transport().invoke(target, invocation).await
        }
    }

    /// Runs a partition-routed operation at the partition owner.
    pub async fn invoke(&self, operation: Operation) -> GridResult<OperationResult> {
        let key = operation
            .routing_key()
            .ok_or_else(|| GridError::Rejected {
                reason: "operation has no routing key".to_string(),
            })?
            .to_string();
        let invocation = Invocation::new(operation);
        let mut delay_ms = BACKOFF_BASE_MS;

        for attempt in 1..=INVOKE_ATTEMPTS {
            let outcome = match self.context.route(&key) {
                Ok(target) => self.send(&target, invocation.clone()).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < INVOKE_ATTEMPTS => {
                    tracing::debug!(attempt, key = %key, "Re-routing operation: {}", e);
                    backoff(&mut delay_ms).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(GridError::PartitionUnavailable {
            partition: self.context.partition_of(&key),
        })
    }

    /// Runs a node-scoped operation once on every node that owns a partition.
    pub async fn invoke_on_all(&self, operation: Operation) -> GridResult<Vec<OperationResult>> {
        let invocation = Invocation::new(operation);
        let mut delay_ms = BACKOFF_BASE_MS;

        for attempt in 1..=INVOKE_ATTEMPTS {
            let table = self.context.table();
            let mut owners = BTreeSet::new();
            let mut unowned = None;
            for assignment in &table.assignments {
                match &assignment.owner {
                    Some(owner) => {
                        owners.insert(owner.clone());
                    }
                    None => unowned = Some(assignment.partition),
                }
            }

            let outcome = match unowned {
                Some(partition) => Err(GridError::PartitionUnavailable { partition }),
                None => {
                    let calls = owners
                        .iter()
                        .map(|owner| self.send(owner, invocation.clone()));
                    futures::future::join_all(calls)
                        .await
                        .into_iter()
                        .collect::<GridResult<Vec<_>>>()
                }
            };
            match outcome {
                Ok(results) => return Ok(results),
                Err(e) if e.is_retryable() && attempt < INVOKE_ATTEMPTS => {
                    tracing::debug!(attempt, "Retrying cluster-wide operation: {}", e);
                    backoff(&mut delay_ms).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(GridError::Rejected {
            reason: "retry attempts exhausted".to_string(),
        })
    }
}

async fn backoff(delay_ms: &mut u64) {
    let jitter = rand::random::<u64>() % 50;
    tokio::time::sleep(Duration::from_millis(*delay_ms + jitter)).await;
    *delay_ms = (*delay_ms * 2).min(BACKOFF_MAX_MS);
}
