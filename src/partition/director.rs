use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::table::{
    PartitionAssignment, PartitionId, PartitionTable, new_replicas, rebalance, strip_dead,
};
use crate::config::MigrationConfig;
use crate::error::{GridError, GridResult};
use crate::membership::service::MembershipService;
use crate::membership::types::{MembershipEvent, NodeId};
use crate::transport::ClusterTransport;

/// A partition that gains replicas which do not hold its data yet.
#[derive(Debug, Clone)]
struct MigrationTask {
    partition: PartitionId,
    target: PartitionAssignment,
    destinations: Vec<NodeId>,
}

/// Keeps the partition table in step with membership.
///
/// Runs on every node. Every node installs the newest table it is given; only the
/// master (lowest live node id) reacts to membership events by computing, migrating
/// and publishing new tables.
pub struct PartitionDirector {
    local_id: NodeId,
    backup_count: usize,
    migration: MigrationConfig,
    membership: Arc<MembershipService>,
    transport: Arc<dyn ClusterTransport>,
    table_tx: watch::Sender<Arc<PartitionTable>>,
    /// Serializes table edits made by this node as master.
    publish_lock: Mutex<()>,
    publish_floor: AtomicU64,
    last_event: AtomicU64,
}

impl PartitionDirector {
    pub fn new(
        partition_count: u32,
        backup_count: usize,
        migration: MigrationConfig,
        membership: Arc<MembershipService>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        let (table_tx, _) = watch::channel(Arc::new(PartitionTable::new(partition_count)));
        Arc::new(Self {
            local_id: membership.local_node.id.clone(),
            backup_count,
            migration,
            membership,
            transport,
            table_tx,
            publish_lock: Mutex::new(()),
            publish_floor: AtomicU64::new(0),
            last_event: AtomicU64::new(0),
        })
    }

    pub fn table(&self) -> Arc<PartitionTable> {
        self.table_tx.borrow().clone()
    }

    pub fn subscribe_table(&self) -> watch::Receiver<Arc<PartitionTable>> {
        self.table_tx.subscribe()
    }

    pub fn backup_count(&self) -> usize {
        self.backup_count
    }

    /// Installs `table` if it is newer than the current one. Returns the version in
    /// force afterwards, so a publisher can tell when it was rejected.
    pub fn install(&self, table: PartitionTable) -> u64 {
        let mut installed = false;
        self.table_tx.send_if_modified(|current| {
            if table.version > current.version {
                *current = Arc::new(table.clone());
                installed = true;
                true
            } else {
                false
            }
        });
        let now = self.table_tx.borrow().version;
        if installed {
            tracing::debug!(version = now, "Installed partition table");
        } else {
            tracing::debug!(
                offered = table.version,
                current = now,
                "Ignored stale partition table"
            );
        }
        now
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let director = self.clone();
        tokio::spawn(async move { director.run().await })
    }

    /// Handles each membership event on its own task. A newer event cancels the
    /// one in flight, so its promotions are published without waiting for the
    /// migrations of the older view.
    async fn run(self: Arc<Self>) {
        let mut events = self.membership.subscribe();
        let mut next = Some(self.membership.current_event());
        // Dropping the set when this task is aborted cancels its migrations too.
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            let mut event = match next.take() {
                Some(event) => event,
                None => match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Director lagged behind membership events");
                        self.membership.current_event()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            // Only the newest queued view matters.
            loop {
                match events.try_recv() {
                    Ok(newer) if newer.version > event.version => event = newer,
                    Ok(_) => {}
                    Err(broadcast::error::TryRecvError::Lagged(_)) => {
                        event = self.membership.current_event();
                    }
                    Err(_) => break,
                }
            }

            in_flight.abort_all();
            while let Some(joined) = in_flight.join_next().await {
                if joined.is_err_and(|e| e.is_cancelled()) {
                    tracing::info!(
                        version = event.version,
                        "Cancelled migrations of an older membership view"
                    );
                }
            }
            let director = self.clone();
            in_flight.spawn(async move {
                director.on_membership_event(event).await;
            });
        }
        tracing::info!("Partition director stopped");
    }

    pub fn is_master(&self, event: &MembershipEvent) -> bool {
        event.live_nodes.first() == Some(&self.local_id)
    }

    /// Handles one membership event. Returns `false` for a stale event, which is
    /// discarded without effect.
    pub async fn on_membership_event(&self, event: MembershipEvent) -> bool {
        let previous = self.last_event.fetch_max(event.version, Ordering::SeqCst);
        if event.version <= previous {
            tracing::debug!(
                version = event.version,
                last = previous,
                "Discarding stale membership event"
            );
            return false;
        }
        if !self.is_master(&event) {
            return true;
        }
        tracing::info!(
            version = event.version,
            live = event.live_nodes.len(),
            "Rebalancing partitions as master"
        );
        self.rebalance_for(&event).await;
        true
    }

    async fn rebalance_for(&self, event: &MembershipEvent) {
        let live = &event.live_nodes;
        let current = self.table();

        // 1. Promote surviving backups right away.
        let interim = strip_dead(&current.assignments, live);
        for (before, after) in current.assignments.iter().zip(interim.iter()) {
            if before.owner.is_some() && after.owner.is_none() {
                tracing::error!(
                    partition = before.partition,
                    "All replicas of partition lost, it restarts empty"
                );
            }
        }

        // 2. Target placement.
        let target = rebalance(&interim, live, self.backup_count);

        // 3. Partitions that need no data movement go live at once.
        let mut direct = interim.clone();
        let mut tasks = Vec::new();
        for (cur, tgt) in interim.iter().zip(target.iter()) {
            let destinations = new_replicas(cur, tgt);
            if cur.owner.is_none() || destinations.is_empty() {
                direct[tgt.partition as usize] = tgt.clone();
            } else {
                tasks.push(MigrationTask {
                    partition: tgt.partition,
                    target: tgt.clone(),
                    destinations,
                });
            }
        }
        self.publish(direct, event.version).await;

        if tasks.is_empty() {
            return;
        }

        // 4. Migrations.
        tracing::info!(count = tasks.len(), "Starting partition migrations");
        let mut started = Vec::with_capacity(tasks.len());
        let begun: Vec<(MigrationTask, GridResult<()>)> = futures::stream::iter(tasks)
            .map(|task| async move {
                let result = self.begin_on_destinations(&task).await;
                (task, result)
            })
            .buffer_unordered(self.migration.parallelism.max(1))
            .collect()
            .await;
        for (task, result) in begun {
            match result {
                Ok(()) => started.push(task),
                Err(e) => tracing::warn!(
                    partition = task.partition,
                    "Could not start migration: {}",
                    e
                ),
            }
        }
        if started.is_empty() {
            return;
        }

        self.edit_and_publish(event.version, |assignments| {
            for task in &started {
                assignments[task.partition as usize].incoming = task.destinations.clone();
            }
        })
        .await;

        let mut results = futures::stream::iter(started)
            .map(|task| async move {
                let outcome = self.migrate(&task).await;
                (task, outcome)
            })
            .buffer_unordered(self.migration.parallelism.max(1));

        let batch_size = self.migration.parallelism.max(1);
        let mut flips: Vec<PartitionAssignment> = Vec::new();
        let mut failed: Vec<PartitionId> = Vec::new();
        while let Some((task, outcome)) = results.next().await {
            match outcome {
                Ok(()) => {
                    let mut flipped = task.target.clone();
                    flipped.backups.retain(|n| self.membership.is_alive(n));
                    flipped.incoming.clear();
                    flips.push(flipped);
                }
                Err(e) => {
                    tracing::error!(
                        partition = task.partition,
                        "Migration failed, keeping current placement: {}",
                        e
                    );
                    failed.push(task.partition);
                }
            }
            if flips.len() >= batch_size {
                let batch = std::mem::take(&mut flips);
                self.apply_flips(event.version, batch, Vec::new()).await;
            }
        }
        if !flips.is_empty() || !failed.is_empty() {
            self.apply_flips(event.version, flips, failed).await;
        }
        tracing::info!(version = event.version, "Partition migrations finished");
    }

    async fn apply_flips(
        &self,
        membership_version: u64,
        flips: Vec<PartitionAssignment>,
        failed: Vec<PartitionId>,
    ) {
        self.edit_and_publish(membership_version, |assignments| {
            for flipped in flips {
                let idx = flipped.partition as usize;
                assignments[idx] = flipped;
            }
            for partition in failed {
                assignments[partition as usize].incoming.clear();
            }
        })
        .await;
    }

    async fn begin_on_destinations(&self, task: &MigrationTask) -> GridResult<()> {
        let timeout = Duration::from_millis(self.migration.timeout_ms);
        for destination in &task.destinations {
            with_timeout(
                timeout,
                destination,
                self.transport.begin_migration(destination, task.partition),
            )
            .await?;
        }
        Ok(())
    }

    /// Streams a snapshot from a live replica to every destination, retrying with
    /// exponential backoff. A dead source is replaced by the next live replica.
    async fn migrate(&self, task: &MigrationTask) -> GridResult<()> {
        let timeout = Duration::from_millis(self.migration.timeout_ms);
        let mut delay_ms = self.migration.backoff_base_ms.max(1);
        let attempts = self.migration.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.try_migrate(task, timeout, attempt > 1).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt == attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        partition = task.partition,
                        attempt,
                        "Migration attempt failed: {}",
                        e
                    );
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(self.migration.backoff_max_ms.max(1));
                }
            }
        }
        Err(GridError::PartitionUnavailable {
            partition: task.partition,
        })
    }

    async fn try_migrate(
        &self,
        task: &MigrationTask,
        timeout: Duration,
        restart: bool,
    ) -> GridResult<()> {
        let destinations: Vec<&NodeId> = task
            .destinations
            .iter()
            .filter(|n| self.membership.is_alive(n))
            .collect();
        if destinations.is_empty() {
            return Ok(());
        }

        let table = self.table();
        let source = table
            .assignment(task.partition)
            .and_then(|a| {
                a.replicas()
                    .find(|n| self.membership.is_alive(n) && !task.destinations.contains(n))
                    .cloned()
            })
            .ok_or(GridError::PartitionUnavailable {
                partition: task.partition,
            })?;

        if restart {
            for destination in &destinations {
                with_timeout(
                    timeout,
                    destination,
                    self.transport.begin_migration(destination, task.partition),
                )
                .await?;
            }
        }

        let snapshot = with_timeout(
            timeout,
            &source,
            self.transport.fetch_snapshot(&source, task.partition),
        )
        .await?;
        tracing::debug!(
            partition = task.partition,
            seq = snapshot.seq,
            "Fetched snapshot from {}",
            source
        );

        for destination in destinations {
            with_timeout(
                timeout,
                destination,
                self.transport
                    .install_snapshot(destination, snapshot.clone()),
            )
            .await?;
        }
        Ok(())
    }

    async fn edit_and_publish<F>(&self, membership_version: u64, edit: F)
    where
        F: FnOnce(&mut Vec<PartitionAssignment>),
    {
        let mut assignments = self.table().assignments.clone();
        edit(&mut assignments);
        self.publish(assignments, membership_version).await;
    }

    /// Installs a new table locally and pushes it to every live peer.
    pub async fn publish(&self, assignments: Vec<PartitionAssignment>, membership_version: u64) {
        let _guard = self.publish_lock.lock().await;

        for _ in 0..2 {
            let version = self.table().version.max(self.publish_floor.load(Ordering::SeqCst)) + 1;
            let table = PartitionTable {
                version,
                membership_version,
                assignments: assignments.clone(),
            };
            self.install(table.clone());

            let peers: Vec<NodeId> = self
                .membership
                .live_node_ids()
                .into_iter()
                .filter(|n| n != &self.local_id)
                .collect();
            let pushes = peers.iter().map(|peer| {
                let table = table.clone();
                async move { (peer, self.transport.publish_table(peer, table).await) }
            });

            let mut rejected = false;
            for (peer, result) in futures::future::join_all(pushes).await {
                match result {
                    Ok(theirs) if theirs > version => {
                        tracing::warn!(
                            "{} already has table version {} (published {})",
                            peer,
                            theirs,
                            version
                        );
                        self.publish_floor.fetch_max(theirs, Ordering::SeqCst);
                        rejected = true;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to publish table to {}: {}", peer, e),
                }
            }
            tracing::info!(version, peers = peers.len(), "Published partition table");
            if !rejected {
                return;
            }
        }
    }
}

async fn with_timeout<T, F>(timeout: Duration, node: &NodeId, fut: F) -> GridResult<T>
where
    F: std::future::Future<Output = GridResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| GridError::transport(node, "timed out"))?
}
