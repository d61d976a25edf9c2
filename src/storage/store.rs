//! Partition Store
//!
//! Holds the partition containers of one node and is the only place that mutates
//! them. Every partition is a slot guarded by a `tokio::sync::Mutex`, which is the
//! partition's single-writer domain:
//!
//! - **Owner path** (`execute`): check ownership against the current table, compute
//!   the ops, then per op assign the next sequence, append it to the WAL, apply it and
//!   queue it for replication, all under the lock. The lock is released before
//!   waiting for synchronous backup acks.
//! - **Backup path** (`apply_replica`): apply the record that follows the slot's
//!   sequence, ignore older ones and report a `ReplicaGap` for anything further ahead.
//! - **Migration**: `begin_migration` puts a slot in receiving mode (records are
//!   buffered), `install_snapshot` replaces its contents and replays the buffer.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};

use super::container::PartitionContainer;
use super::map::{self, EntryProcessorRegistry, MapContext};
use super::replication::Replicator;
use super::types::{
    OpRecord, Operation, OperationResult, PartitionOp, PartitionSnapshot, now_ms,
};
use crate::config::ConfigRegistry;
use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;
use crate::partition::{PartitionAssignment, PartitionId, PartitionTable};
use crate::primitives::topic::TopicHub;
use crate::primitives::{queue, topic};
use crate::wal::WriteAheadLog;

#[derive(Debug)]
pub enum SlotMode {
    Active,
    /// Migration destination waiting for its snapshot.
    Receiving { buffer: Vec<OpRecord> },
}

#[derive(Debug)]
pub struct PartitionSlot {
    pub container: PartitionContainer,
    /// Sequence of the last op applied.
    pub seq: u64,
    pub mode: SlotMode,
}

impl Default for PartitionSlot {
    fn default() -> Self {
        Self {
            container: PartitionContainer::default(),
            seq: 0,
            mode: SlotMode::Active,
        }
    }
}

pub struct PartitionStore {
    local_id: NodeId,
    slots: DashMap<PartitionId, Arc<Mutex<PartitionSlot>>>,
    tables: watch::Receiver<Arc<PartitionTable>>,
    configs: Arc<ConfigRegistry>,
    processors: Arc<EntryProcessorRegistry>,
    replicator: Arc<Replicator>,
    topics: Arc<TopicHub>,
    wal: Option<Arc<dyn WriteAheadLog>>,
    ticker: AtomicU64,
    replication_timeout: Duration,
}

impl PartitionStore {
    pub fn new(
        local_id: NodeId,
        tables: watch::Receiver<Arc<PartitionTable>>,
        configs: Arc<ConfigRegistry>,
        processors: Arc<EntryProcessorRegistry>,
        replicator: Arc<Replicator>,
        topics: Arc<TopicHub>,
        wal: Option<Arc<dyn WriteAheadLog>>,
    ) -> Self {
        let replication_timeout = configs.grid().replication_timeout();
        Self {
            local_id,
            slots: DashMap::new(),
            tables,
            configs,
            processors,
            replicator,
            topics,
            wal,
            ticker: AtomicU64::new(0),
            replication_timeout,
        }
    }

    fn slot(&self, partition: PartitionId) -> Arc<Mutex<PartitionSlot>> {
        self.slots
            .entry(partition)
            .or_insert_with(|| Arc::new(Mutex::new(PartitionSlot::default())))
            .clone()
    }

    fn existing_slot(&self, partition: PartitionId) -> Option<Arc<Mutex<PartitionSlot>>> {
        self.slots.get(&partition).map(|s| s.value().clone())
    }

    fn tick(&self) -> u64 {
        self.ticker.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn table(&self) -> Arc<PartitionTable> {
        self.tables.borrow().clone()
    }

    pub fn partition_count(&self) -> u32 {
        self.configs.grid().partition_count
    }

    /// The partition's assignment if this node owns it.
    fn owned_assignment(&self, partition: PartitionId) -> GridResult<PartitionAssignment> {
        let table = self.table();
        let assignment = table
            .assignment(partition)
            .ok_or(GridError::PartitionUnavailable { partition })?;
        match &assignment.owner {
            Some(owner) if owner == &self.local_id => Ok(assignment.clone()),
            Some(owner) => Err(GridError::NotOwner {
                partition,
                owner: Some(owner.clone()),
            }),
            None => Err(GridError::PartitionUnavailable { partition }),
        }
    }

    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        self.table().owned_by(&self.local_id)
    }

    /// Partitions with a local slot.
    pub fn local_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.slots.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    /// Number of backups that must acknowledge writes to `name`.
    fn sync_backups(&self, operation: &Operation) -> usize {
        match operation {
            Operation::Map { map, .. } => self.configs.map(map).backup_count,
            Operation::Queue { queue, .. } => self.configs.queue(queue).backup_count,
            Operation::Topic { topic, .. } => self.configs.topic(topic).backup_count,
            Operation::OwnedMapSize { map } | Operation::ExecuteOnOwnedEntries { map, .. } => {
                self.configs.map(map).backup_count
            }
        }
    }

    /// Runs a partition-routed operation at this node, which must own the partition.
    pub async fn execute(
        &self,
        partition: PartitionId,
        operation: &Operation,
    ) -> GridResult<OperationResult> {
        self.execute_request(partition, None, operation).await
    }

    /// Like [`execute`](Self::execute), but a mutation already applied under
    /// `request_id` is answered from the partition's request log.
    pub async fn execute_request(
        &self,
        partition: PartitionId,
        request_id: Option<&str>,
        operation: &Operation,
    ) -> GridResult<OperationResult> {
        let sync_backups = self.sync_backups(operation);
        self.mutate_once(partition, sync_backups, request_id, |container, now, tick| match operation {
            Operation::Map { map, key, op } => {
                let config = self.configs.map(map);
                let ctx = MapContext {
                    now_ms: now,
                    tick,
                    default_ttl_ms: config.default_ttl().map(|d| d.as_millis() as u64),
                    processors: &self.processors,
                };
                map::execute(container, map, key, op, &ctx)
            }
            Operation::Queue { queue, op } => {
                let max_size = self.configs.queue(queue).max_size;
                queue::execute(container, queue, op, max_size)
            }
            Operation::Topic { topic, op } => {
                let retention = self.configs.topic(topic).retention;
                topic::execute(container, topic, op, retention)
            }
            Operation::OwnedMapSize { .. } | Operation::ExecuteOnOwnedEntries { .. } => Err(
                GridError::Rejected {
                    reason: "node-scoped operation routed to a partition".to_string(),
                },
            ),
        })
        .await
    }

    /// [`mutate`](Self::mutate) for client requests. A non-empty batch ends with a
    /// `RecordRequest` op, so the result is replicated along with the change.
    async fn mutate_once<F>(
        &self,
        partition: PartitionId,
        sync_backups: usize,
        request_id: Option<&str>,
        f: F,
    ) -> GridResult<OperationResult>
    where
        F: FnOnce(
            &mut PartitionContainer,
            u64,
            u64,
        ) -> GridResult<(OperationResult, Vec<PartitionOp>)>,
    {
        self.mutate(partition, sync_backups, |container, now, tick| {
            let Some(request_id) = request_id else {
                return f(container, now, tick);
            };
            if let Some(result) = container.requests.get(request_id) {
                tracing::debug!(partition, request_id, "Answering repeated request from the log");
                return Ok((result.clone(), Vec::new()));
            }
            let (result, mut ops) = f(container, now, tick)?;
            if !ops.is_empty() {
                ops.push(PartitionOp::RecordRequest {
                    request_id: request_id.to_string(),
                    result: result.clone(),
                });
            }
            Ok((result, ops))
        })
        .await
    }

    /// Owner-side mutation of one partition. `f` computes the result and the ops
    /// from the container; the ops are then sequenced, logged, applied and replicated.
    pub(crate) async fn mutate<R, F>(
        &self,
        partition: PartitionId,
        sync_backups: usize,
        f: F,
    ) -> GridResult<R>
    where
        F: FnOnce(&mut PartitionContainer, u64, u64) -> GridResult<(R, Vec<PartitionOp>)>,
    {
        let slot = self.slot(partition);
        let mut state = slot.lock().await;

        let assignment = self.owned_assignment(partition)?;
        if matches!(state.mode, SlotMode::Receiving { .. }) {
            return Err(GridError::PartitionUnavailable { partition });
        }

        let tick = self.tick();
        let (result, ops) = f(&mut state.container, now_ms(), tick)?;
        if ops.is_empty() {
            return Ok(result);
        }

        let sync_count = sync_backups.min(assignment.backups.len());
        let sync_targets = &assignment.backups[..sync_count];
        let mut async_targets: Vec<NodeId> = assignment.backups[sync_count..].to_vec();
        for node in &assignment.incoming {
            if !assignment.is_replica(node) && node != &self.local_id {
                async_targets.push(node.clone());
            }
        }

        let mut acks = Vec::new();
        let mut last_seq = state.seq;
        for op in ops {
            let seq = state.seq + 1;
            if let Some(wal) = &self.wal {
                wal.append(partition, seq, &op)?;
            }
            state.container.apply(&op, seq, tick)?;
            state.seq = seq;
            last_seq = seq;

            if let PartitionOp::TopicPublish { message, .. } = &op {
                self.topics.fan_out(message.clone());
            }
            acks.extend(self.replicator.enqueue(
                OpRecord { partition, seq, op },
                sync_targets,
                &async_targets,
            ));
        }
        drop(state);

        self.await_acks(partition, last_seq, acks).await?;
        Ok(result)
    }

    async fn await_acks(
        &self,
        partition: PartitionId,
        seq: u64,
        acks: Vec<oneshot::Receiver<bool>>,
    ) -> GridResult<()> {
        if acks.is_empty() {
            return Ok(());
        }
        let all = futures::future::join_all(acks);
        match tokio::time::timeout(self.replication_timeout, all).await {
            Ok(results) if results.iter().all(|r| matches!(r, Ok(true))) => Ok(()),
            Ok(_) => Err(GridError::ReplicationTimeout { partition, seq }),
            Err(_) => {
                tracing::warn!(partition, seq, "Synchronous backups did not ack in time");
                Err(GridError::ReplicationTimeout { partition, seq })
            }
        }
    }

    /// Backup side: applies a record shipped by the owner.
    pub async fn apply_replica(&self, record: OpRecord) -> GridResult<()> {
        let slot = self.slot(record.partition);
        let mut state = slot.lock().await;

        if let SlotMode::Receiving { buffer } = &mut state.mode {
            buffer.push(record);
            return Ok(());
        }
        if record.seq <= state.seq {
            tracing::trace!(
                partition = record.partition,
                seq = record.seq,
                "Ignoring duplicate record"
            );
            return Ok(());
        }
        if record.seq != state.seq + 1 {
            return Err(GridError::ReplicaGap {
                partition: record.partition,
                expected: state.seq + 1,
                received: record.seq,
            });
        }
        if let Some(wal) = &self.wal {
            wal.append(record.partition, record.seq, &record.op)?;
        }
        let tick = self.tick();
        state.container.apply(&record.op, record.seq, tick)?;
        state.seq = record.seq;
        Ok(())
    }

    /// Resets the partition and starts buffering incoming records until a snapshot
    /// is installed.
    pub async fn begin_migration(&self, partition: PartitionId) -> GridResult<()> {
        let slot = self.slot(partition);
        let mut state = slot.lock().await;
        state.container = PartitionContainer::default();
        state.seq = 0;
        state.mode = SlotMode::Receiving { buffer: Vec::new() };
        if let Some(wal) = &self.wal {
            wal.truncate(partition)?;
        }
        tracing::debug!(partition, "Receiving partition");
        Ok(())
    }

    pub async fn snapshot(&self, partition: PartitionId) -> GridResult<PartitionSnapshot> {
        let slot = self.slot(partition);
        let state = slot.lock().await;
        if matches!(state.mode, SlotMode::Receiving { .. }) {
            return Err(GridError::PartitionUnavailable { partition });
        }
        Ok(PartitionSnapshot {
            partition,
            seq: state.seq,
            container: state.container.clone(),
        })
    }

    /// Installs a snapshot, then replays the buffered records that follow it without
    /// a gap. An active slot ignores a snapshot older than its own state.
    pub async fn install_snapshot(&self, snapshot: PartitionSnapshot) -> GridResult<()> {
        let partition = snapshot.partition;
        let slot = self.slot(partition);
        let mut state = slot.lock().await;

        if matches!(state.mode, SlotMode::Active) && snapshot.seq < state.seq {
            tracing::debug!(
                partition,
                offered = snapshot.seq,
                current = state.seq,
                "Ignoring stale partition snapshot"
            );
            return Ok(());
        }

        let mut buffered = match std::mem::replace(&mut state.mode, SlotMode::Active) {
            SlotMode::Receiving { buffer } => buffer,
            SlotMode::Active => Vec::new(),
        };
        buffered.sort_by_key(|r| r.seq);

        if let Some(wal) = &self.wal {
            wal.reset(partition, &snapshot)?;
        }
        let base_seq = snapshot.seq;
        state.container = snapshot.container;
        state.seq = base_seq;

        let tick = self.tick();
        let mut replayed = 0;
        for record in buffered {
            if record.seq <= state.seq {
                continue;
            }
            if record.seq != state.seq + 1 {
                // The owner resends the partition on the next record.
                tracing::warn!(partition, seq = record.seq, "Buffered records have a gap");
                break;
            }
            if let Some(wal) = &self.wal {
                wal.append(partition, record.seq, &record.op)?;
            }
            state.container.apply(&record.op, record.seq, tick)?;
            state.seq = record.seq;
            replayed += 1;
        }
        tracing::debug!(
            partition,
            seq = base_seq,
            replayed,
            "Installed partition snapshot"
        );
        Ok(())
    }

    /// Drops every local partition this node neither replicates nor receives under
    /// `table`.
    pub fn retain_replicated(&self, table: &PartitionTable) {
        let mut dropped = Vec::new();
        self.slots.retain(|partition, _| {
            let keep = table
                .assignment(*partition)
                .is_some_and(|a| a.keeps_data(&self.local_id));
            if !keep {
                dropped.push(*partition);
            }
            keep
        });
        if dropped.is_empty() {
            return;
        }
        if let Some(wal) = &self.wal {
            for partition in &dropped {
                if let Err(e) = wal.truncate(*partition) {
                    tracing::warn!(partition, "Failed to truncate WAL segment: {}", e);
                }
            }
        }
        tracing::info!(count = dropped.len(), "Dropped partitions no longer replicated here");
    }

    /// Rebuilds partitions from the WAL. Returns how many were restored.
    pub async fn recover(&self) -> GridResult<usize> {
        let Some(wal) = &self.wal else {
            return Ok(0);
        };
        let partitions = wal.partitions()?;
        for partition in &partitions {
            let replay = wal.replay(*partition)?;
            let slot = self.slot(*partition);
            let mut state = slot.lock().await;
            if let Some(snapshot) = replay.snapshot {
                state.container = snapshot.container;
                state.seq = snapshot.seq;
            }
            for (seq, op) in replay.records {
                if seq <= state.seq {
                    continue;
                }
                state.container.apply(&op, seq, 0)?;
                state.seq = seq;
            }
        }
        if !partitions.is_empty() {
            tracing::info!(count = partitions.len(), "Recovered partitions from WAL");
        }
        Ok(partitions.len())
    }

    /// Live entries of `map` in the partitions this node owns.
    pub async fn owned_map_size(&self, map: &str) -> GridResult<usize> {
        let now = now_ms();
        let mut total = 0;
        for partition in self.owned_partitions() {
            let Some(slot) = self.existing_slot(partition) else {
                continue;
            };
            let state = slot.lock().await;
            if let Some(store) = state.container.map(map)? {
                total += store.live_len(now);
            }
        }
        Ok(total)
    }

    /// Runs `processor` over the entries of `map_name` in every partition this node
    /// owns. A retry under the same `request_id` skips partitions already processed.
    pub async fn execute_on_owned_entries(
        &self,
        map_name: &str,
        processor: &str,
        argument: &Value,
        request_id: Option<&str>,
    ) -> GridResult<BTreeMap<String, Value>> {
        let config = self.configs.map(map_name);
        let mut merged = BTreeMap::new();
        for partition in self.owned_partitions() {
            let results = self
                .mutate_once(partition, config.backup_count, request_id, |container, now, tick| {
                    let ctx = MapContext {
                        now_ms: now,
                        tick,
                        default_ttl_ms: config.default_ttl().map(|d| d.as_millis() as u64),
                        processors: &self.processors,
                    };
                    let (results, ops) =
                        map::execute_on_all(container, map_name, processor, argument, &ctx)?;
                    Ok((OperationResult::ProcessedMany(results), ops))
                })
                .await?
                .into_processed_many()?;
            merged.extend(results);
        }
        Ok(merged)
    }

    /// Reads the container of a local partition without any ownership check.
    pub async fn inspect<R, F>(&self, partition: PartitionId, f: F) -> Option<R>
    where
        F: FnOnce(&PartitionSlot) -> R,
    {
        let slot = self.existing_slot(partition)?;
        let state = slot.lock().await;
        Some(f(&state))
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }
}
