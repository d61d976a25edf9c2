//! Per-node wiring of every grid component.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::gateway::GridClient;
use crate::config::{ConfigRegistry, GridConfig};
use crate::cp::{CpRequest, CpResponse, CpService, RaftMessage};
use crate::error::{GridError, GridResult};
use crate::executor::registry::TaskHandlerRegistry;
use crate::executor::service::{DistributedExecutor, ExecutorService};
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::partition::{PartitionDirector, PartitionId, PartitionTable, partition_for};
use crate::primitives::queue::DistributedQueue;
use crate::primitives::topic::{DistributedTopic, TopicHub, TopicMessage};
use crate::storage::eviction::EvictionManager;
use crate::storage::map::{DistributedMap, EntryProcessorRegistry};
use crate::storage::replication::Replicator;
use crate::storage::store::PartitionStore;
use crate::storage::types::{Invocation, OpRecord, Operation, OperationResult, PartitionSnapshot};
use crate::transport::{ClusterTransport, InboundHandler};
use crate::wal::{FileWal, WriteAheadLog};

/// Everything one node runs, built by [`join`](Self::join) and stopped by
/// [`leave`](Self::leave). Components get what they need from here instead of from
/// global state.
pub struct ClusterContext {
    local_id: NodeId,
    configs: Arc<ConfigRegistry>,
    membership: Arc<MembershipService>,
    transport: Arc<dyn ClusterTransport>,
    director: Arc<PartitionDirector>,
    store: Arc<PartitionStore>,
    topics: Arc<TopicHub>,
    processors: Arc<EntryProcessorRegistry>,
    handlers: Arc<TaskHandlerRegistry>,
    eviction: Arc<EvictionManager>,
    cp: Arc<CpService>,
    executors: Arc<ExecutorService>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ClusterContext {
    /// Builds and starts a node. Membership is started last, once the node can
    /// serve every inbound call.
    pub async fn join(
        config: GridConfig,
        membership: Arc<MembershipService>,
        transport: Arc<dyn ClusterTransport>,
    ) -> GridResult<Arc<Self>> {
        config.validate()?;
        let local_id = membership.local_node.id.clone();
        tracing::info!(
            cluster = %config.cluster_name,
            partitions = config.partition_count,
            "Node {} joining",
            local_id
        );

        let configs = Arc::new(ConfigRegistry::new(config.clone()));
        let director = PartitionDirector::new(
            config.partition_count,
            config.table_backup_count(),
            config.migration.clone(),
            membership.clone(),
            transport.clone(),
        );
        let topics = TopicHub::new(membership.clone(), transport.clone(), configs.clone());

        let replicator = Arc::new(Replicator::new(
            local_id.clone(),
            transport.clone(),
            config.replication.retries,
            config.replication_timeout(),
        ));

        let wal: Option<Arc<dyn WriteAheadLog>> = match &config.wal_dir {
            Some(dir) => Some(Arc::new(FileWal::open(dir)?)),
            None => None,
        };

        let processors = EntryProcessorRegistry::new();
        let store = Arc::new(PartitionStore::new(
            local_id.clone(),
            director.subscribe_table(),
            configs.clone(),
            processors.clone(),
            replicator.clone(),
            topics.clone(),
            wal,
        ));
        store.recover().await?;

        let eviction = EvictionManager::new(store.clone(), configs.clone());
        let cp = CpService::start(local_id.clone(), config.cp.clone(), transport.clone());
        let handlers = TaskHandlerRegistry::new();
        let executors = ExecutorService::new(configs.clone(), handlers.clone());

        let context = Arc::new(Self {
            local_id,
            configs,
            membership: membership.clone(),
            transport,
            director: director.clone(),
            store: store.clone(),
            topics,
            processors,
            handlers,
            eviction,
            cp,
            executors,
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        let mut tasks = vec![director.spawn()];
        let mut tables = director.subscribe_table();
        tasks.push(tokio::spawn(async move {
            while tables.changed().await.is_ok() {
                let table = tables.borrow_and_update().clone();
                store.retain_replicated(&table);
                store.replicator().retain(|partition, node| {
                    table
                        .assignment(partition)
                        .is_some_and(|a| a.keeps_data(node))
                });
            }
        }));
        context.tasks.lock().await.extend(tasks);

        let mut configured: Vec<&String> = config.executors.keys().collect();
        configured.sort();
        for name in configured {
            context.executors.ensure_pool(name, context.client());
        }

        membership.start().await;
        tracing::info!("Node {} joined", context.local_id);
        Ok(context)
    }

    /// Stops every background task of this node and announces the departure.
    pub async fn leave(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Node {} leaving", self.local_id);
        self.membership.leave().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.executors.shutdown();
        self.eviction.shutdown();
        self.topics.shutdown();
        self.cp.shutdown();
        self.store.replicator().shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> GridResult<()> {
        if self.is_shutting_down() {
            Err(GridError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn partition_of(&self, key: &str) -> PartitionId {
        partition_for(key, self.configs.grid().partition_count)
    }

    /// Owner of the partition `key` hashes to, under the table this node holds.
    pub fn route(&self, key: &str) -> GridResult<NodeId> {
        let partition = self.partition_of(key);
        self.table()
            .owner_of(partition)
            .cloned()
            .ok_or(GridError::PartitionUnavailable { partition })
    }

    /// Runs an operation against this node's data. Partition-routed operations fail
    /// with `NotOwner` when this node does not own the partition.
    pub async fn submit(&self, operation: Operation) -> GridResult<OperationResult> {
        self.submit_invocation(Invocation::untracked(operation)).await
    }

    /// Like [`submit`](Self::submit); a mutation already applied under the
    /// invocation's request id is not applied again.
    pub async fn submit_invocation(&self, invocation: Invocation) -> GridResult<OperationResult> {
        self.ensure_running()?;
        let Invocation {
            request_id,
            operation,
        } = invocation;
        match &operation {
            Operation::Map { map, .. } => {
                self.eviction.track(map);
            }
            Operation::OwnedMapSize { map } => {
                self.eviction.track(map);
                let size = self.store.owned_map_size(map).await?;
                return Ok(OperationResult::Size(size));
            }
            Operation::ExecuteOnOwnedEntries {
                map,
                processor,
                argument,
            } => {
                self.eviction.track(map);
                let results = self
                    .store
                    .execute_on_owned_entries(map, processor, argument, request_id.as_deref())
                    .await?;
                return Ok(OperationResult::ProcessedMany(results));
            }
            Operation::Queue { .. } | Operation::Topic { .. } => {}
        }

        let key = operation.routing_key().ok_or_else(|| GridError::Rejected {
            reason: "operation has no routing key".to_string(),
        })?;
        let partition = self.partition_of(key);
        self.store
            .execute_request(partition, request_id.as_deref(), &operation)
            .await
    }

    pub fn client(self: &Arc<Self>) -> GridClient {
        GridClient::new(self.clone())
    }

    pub fn map(self: &Arc<Self>, name: &str) -> DistributedMap {
        DistributedMap::new(name, self.client())
    }

    pub fn queue(self: &Arc<Self>, name: &str) -> DistributedQueue {
        DistributedQueue::new(name, self.client())
    }

    pub fn topic(self: &Arc<Self>, name: &str) -> DistributedTopic {
        let global_ordering = self.configs.topic(name).global_ordering_enabled;
        DistributedTopic::new(name, global_ordering, self.client(), self.topics.clone())
    }

    /// Handle for a named executor. Starts this node's worker pool for it on first use.
    pub fn executor(self: &Arc<Self>, name: &str) -> DistributedExecutor {
        self.executors.ensure_pool(name, self.client());
        let config = self.configs.executor(name);
        DistributedExecutor::new(name, &config, self.client(), self.handlers.clone())
    }

    pub fn table(&self) -> Arc<PartitionTable> {
        self.director.table()
    }

    pub fn configs(&self) -> &Arc<ConfigRegistry> {
        &self.configs
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn transport(&self) -> &Arc<dyn ClusterTransport> {
        &self.transport
    }

    pub fn director(&self) -> &Arc<PartitionDirector> {
        &self.director
    }

    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    pub fn topics(&self) -> &Arc<TopicHub> {
        &self.topics
    }

    pub fn processors(&self) -> &Arc<EntryProcessorRegistry> {
        &self.processors
    }

    pub fn handlers(&self) -> &Arc<TaskHandlerRegistry> {
        &self.handlers
    }

    pub fn eviction(&self) -> &Arc<EvictionManager> {
        &self.eviction
    }

    pub fn cp(&self) -> &Arc<CpService> {
        &self.cp
    }

    pub fn executors(&self) -> &Arc<ExecutorService> {
        &self.executors
    }
}

#[async_trait]
impl InboundHandler for ClusterContext {
    fn node_id(&self) -> &NodeId {
        &self.local_id
    }

    async fn on_invoke(&self, invocation: Invocation) -> GridResult<OperationResult> {
        self.submit_invocation(invocation).await
    }

    async fn on_replicate(&self, record: OpRecord) -> GridResult<()> {
        self.ensure_running()?;
        self.store.apply_replica(record).await
    }

    async fn on_begin_migration(&self, partition: PartitionId) -> GridResult<()> {
        self.ensure_running()?;
        self.store.begin_migration(partition).await
    }

    async fn on_fetch_snapshot(&self, partition: PartitionId) -> GridResult<PartitionSnapshot> {
        self.ensure_running()?;
        self.store.snapshot(partition).await
    }

    async fn on_install_snapshot(&self, snapshot: PartitionSnapshot) -> GridResult<()> {
        self.ensure_running()?;
        self.store.install_snapshot(snapshot).await
    }

    async fn on_publish_table(&self, table: PartitionTable) -> GridResult<u64> {
        self.ensure_running()?;
        Ok(self.director.install(table))
    }

    async fn on_deliver_topic(&self, message: TopicMessage) -> GridResult<()> {
        self.ensure_running()?;
        self.topics.deliver(message);
        Ok(())
    }

    async fn on_raft(&self, message: RaftMessage) -> GridResult<()> {
        self.ensure_running()?;
        self.cp.handle_raft(message);
        Ok(())
    }

    async fn on_cp_request(&self, request: CpRequest) -> GridResult<CpResponse> {
        self.ensure_running()?;
        self.cp.handle_request(request).await
    }
}
