//! Op-log shipping from partition owners to backups.
//!
//! Each `(partition, target)` pair gets a lane: an unbounded channel drained by one
//! task, so a target receives the records of a partition in sequence order and a
//! slow or dead target never holds up the others. Records are pushed into lanes while
//! the partition lock is held; network sends happen in the lane task.
//!
//! A backup only applies the record that directly follows its last one. When a
//! record could not be delivered, or the backup reports a gap, the lane marks the
//! target stale and, before shipping anything else, installs a snapshot of the
//! owner's copy there. The lane sends nothing while the snapshot is in flight, so the
//! target needs no buffering; records already covered by the snapshot are
//! acknowledged without being sent.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::types::OpRecord;
use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;
use crate::partition::PartitionId;
use crate::transport::ClusterTransport;

const BACKOFF_BASE_MS: u64 = 150;
const BACKOFF_MAX_MS: u64 = 1200;

struct Outgoing {
    record: Arc<OpRecord>,
    ack: Option<oneshot::Sender<bool>>,
}

/// Outcome of shipping one record.
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Applied,
    /// The target is missing earlier records.
    Gap,
    Failed,
}

pub struct Replicator {
    local_id: NodeId,
    transport: Arc<dyn ClusterTransport>,
    lanes: DashMap<(PartitionId, NodeId), mpsc::UnboundedSender<Outgoing>>,
    attempts: usize,
    /// Time one record may take across all its attempts and backoff sleeps.
    budget: Duration,
}

impl Replicator {
    pub fn new(
        local_id: NodeId,
        transport: Arc<dyn ClusterTransport>,
        attempts: usize,
        budget: Duration,
    ) -> Self {
        Self {
            local_id,
            transport,
            lanes: DashMap::new(),
            attempts: attempts.max(1),
            budget,
        }
    }

    /// Queues `record` for every target. Returns one ack receiver per synchronous
    /// target; each resolves to `true` once that target applied the record.
    pub fn enqueue(
        &self,
        record: OpRecord,
        sync_targets: &[NodeId],
        async_targets: &[NodeId],
    ) -> Vec<oneshot::Receiver<bool>> {
        let record = Arc::new(record);
        let mut acks = Vec::with_capacity(sync_targets.len());

        for target in sync_targets {
            let (tx, rx) = oneshot::channel();
            self.push(target, record.clone(), Some(tx));
            acks.push(rx);
        }
        for target in async_targets {
            self.push(target, record.clone(), None);
        }
        acks
    }

    fn push(&self, target: &NodeId, record: Arc<OpRecord>, ack: Option<oneshot::Sender<bool>>) {
        let key = (record.partition, target.clone());
        let lane = self
            .lanes
            .entry(key)
            .or_insert_with(|| self.spawn_lane(record.partition, target.clone()))
            .clone();
        if let Err(mpsc::error::SendError(outgoing)) = lane.send(Outgoing { record, ack }) {
            if let Some(ack) = outgoing.ack {
                let _ = ack.send(false);
            }
        }
    }

    fn spawn_lane(&self, partition: PartitionId, target: NodeId) -> mpsc::UnboundedSender<Outgoing> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let mut lane = Lane {
            partition,
            target,
            local_id: self.local_id.clone(),
            transport: self.transport.clone(),
            attempts: self.attempts,
            budget: self.budget,
            stale: false,
            synced_through: 0,
        };

        tokio::spawn(async move {
            tracing::debug!(partition, "Replication lane to {} opened", lane.target);
            while let Some(outgoing) = rx.recv().await {
                let delivered = lane.ship(&outgoing.record).await;
                if let Some(ack) = outgoing.ack {
                    let _ = ack.send(delivered);
                }
            }
            tracing::debug!(partition, "Replication lane to {} closed", lane.target);
        });
        tx
    }

    /// Closes the lanes for which `keep` is false. Their tasks finish the records
    /// already queued and exit.
    pub fn retain<F>(&self, keep: F)
    where
        F: Fn(PartitionId, &NodeId) -> bool,
    {
        self.lanes.retain(|(partition, target), _| keep(*partition, target));
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn shutdown(&self) {
        self.lanes.clear();
    }
}

/// State of one lane task.
struct Lane {
    partition: PartitionId,
    target: NodeId,
    local_id: NodeId,
    transport: Arc<dyn ClusterTransport>,
    attempts: usize,
    budget: Duration,
    /// The target may be missing records and needs a snapshot first.
    stale: bool,
    /// Highest sequence covered by the last snapshot installed at the target.
    synced_through: u64,
}

impl Lane {
    async fn ship(&mut self, record: &OpRecord) -> bool {
        if record.seq <= self.synced_through {
            return true;
        }
        if self.stale {
            if !self.resync().await {
                return false;
            }
            if record.seq <= self.synced_through {
                return true;
            }
        }

        match send_with_retry(
            self.transport.as_ref(),
            &self.target,
            record,
            self.attempts,
            self.budget,
        )
        .await
        {
            Delivery::Applied => true,
            Delivery::Gap => {
                tracing::info!(
                    partition = self.partition,
                    seq = record.seq,
                    "Backup {} is behind, resending the partition",
                    self.target
                );
                self.stale = true;
                self.resync().await && record.seq <= self.synced_through
            }
            Delivery::Failed => {
                tracing::warn!(
                    partition = self.partition,
                    seq = record.seq,
                    "Backup {} did not acknowledge after {} attempts",
                    self.target,
                    self.attempts
                );
                self.stale = true;
                false
            }
        }
    }

    /// Replaces the target's copy of the partition with a snapshot of the local one.
    async fn resync(&mut self) -> bool {
        match self.transfer_snapshot().await {
            Ok(seq) => {
                tracing::info!(
                    partition = self.partition,
                    seq,
                    "Backup {} resynchronized",
                    self.target
                );
                self.stale = false;
                self.synced_through = self.synced_through.max(seq);
                true
            }
            Err(e) => {
                tracing::warn!(
                    partition = self.partition,
                    "Could not resynchronize backup {}: {}",
                    self.target,
                    e
                );
                false
            }
        }
    }

    async fn transfer_snapshot(&self) -> GridResult<u64> {
        let step = self.budget;
        let snapshot = bounded(
            step,
            &self.local_id,
            self.transport.fetch_snapshot(&self.local_id, self.partition),
        )
        .await?;
        let seq = snapshot.seq;
        bounded(
            step,
            &self.target,
            self.transport.install_snapshot(&self.target, snapshot),
        )
        .await?;
        Ok(seq)
    }
}

async fn bounded<T, F>(timeout: Duration, node: &NodeId, fut: F) -> GridResult<T>
where
    F: std::future::Future<Output = GridResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| GridError::transport(node, "timed out"))?
}

/// Sends `record` until it is applied, the target reports a gap, or `budget` is
/// spent. Attempts and backoff sleeps both come out of the budget.
async fn send_with_retry(
    transport: &dyn ClusterTransport,
    target: &NodeId,
    record: &OpRecord,
    attempts: usize,
    budget: Duration,
) -> Delivery {
    let deadline = Instant::now() + budget;
    let attempt_timeout = budget / attempts as u32;
    let mut delay_ms = BACKOFF_BASE_MS;

    for attempt in 0..attempts {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let result = tokio::time::timeout(
            attempt_timeout.min(remaining),
            transport.replicate(target, record.clone()),
        )
        .await;
        match result {
            Ok(Ok(())) => return Delivery::Applied,
            Ok(Err(GridError::ReplicaGap { .. })) => return Delivery::Gap,
            Ok(Err(e)) => {
                tracing::debug!("Replicate to {} failed (attempt {}): {}", target, attempt + 1, e)
            }
            Err(_) => tracing::debug!("Replicate to {} timed out (attempt {})", target, attempt + 1),
        }
        if attempt + 1 < attempts {
            let jitter = rand::random::<u64>() % 50;
            let pause = Duration::from_millis(delay_ms + jitter);
            if Instant::now() + pause >= deadline {
                break;
            }
            tokio::time::sleep(pause).await;
            delay_ms = (delay_ms * 2).min(BACKOFF_MAX_MS);
        }
    }
    Delivery::Failed
}
