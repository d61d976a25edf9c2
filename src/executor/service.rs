//! Worker Pools
//!
//! Each named executor queues its tasks in the distributed queue of the same name.
//! Every node runs a pool of `pool_size` workers per executor, but a worker only
//! polls while its node owns the queue's partition, so tasks run on the owner.
//!
//! A task is removed from the queue before its handler runs: execution is
//! at-most-once. A task lost with its worker keeps the `Running` record.
//!
//! Task records live for `result_ttl_seconds` after their last update.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::registry::TaskHandlerRegistry;
use super::types::{Task, TaskId, TaskRecord, TaskStatus};
use crate::cluster::gateway::GridClient;
use crate::config::{ConfigRegistry, ExecutorConfig};
use crate::error::{GridError, GridResult};
use crate::primitives::queue::DistributedQueue;
use crate::storage::map::DistributedMap;
use crate::storage::types::now_ms;

const IDLE_POLL: Duration = Duration::from_millis(100);
const RESULT_POLL: Duration = Duration::from_millis(25);

/// Name of the map holding the task records of `executor`.
pub fn results_map(executor: &str) -> String {
    format!("{}-results", executor)
}

pub struct ExecutorService {
    configs: Arc<ConfigRegistry>,
    handlers: Arc<TaskHandlerRegistry>,
    pools: DashMap<String, Vec<JoinHandle<()>>>,
}

impl ExecutorService {
    pub fn new(configs: Arc<ConfigRegistry>, handlers: Arc<TaskHandlerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            configs,
            handlers,
            pools: DashMap::new(),
        })
    }

    /// Starts the local worker pool of `name` unless it is running already.
    pub fn ensure_pool(&self, name: &str, client: GridClient) {
        let entry = self.pools.entry(name.to_string());
        if let Entry::Vacant(vacant) = entry {
            let config = self.configs.executor(name);
            let mut queue_config = self.configs.grid().queue_config(name);
            queue_config.max_size = config.queue_capacity;
            self.configs.pin_queue(name, queue_config);

            let workers = (0..config.pool_size.max(1))
                .map(|worker_id| {
                    let worker = Worker {
                        worker_id,
                        executor: name.to_string(),
                        queue: DistributedQueue::new(name, client.clone()),
                        results: DistributedMap::new(&results_map(name), client.clone()),
                        result_ttl: config.result_ttl(),
                        client: client.clone(),
                        handlers: self.handlers.clone(),
                    };
                    tokio::spawn(worker.run())
                })
                .collect();
            vacant.insert(workers);
            tracing::info!(
                executor = name,
                workers = config.pool_size,
                capacity = config.queue_capacity,
                "Started executor pool"
            );
        }
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn shutdown(&self) {
        for pool in self.pools.iter() {
            for worker in pool.value() {
                worker.abort();
            }
        }
        self.pools.clear();
    }
}

struct Worker {
    worker_id: usize,
    executor: String,
    queue: DistributedQueue,
    results: DistributedMap,
    result_ttl: Duration,
    client: GridClient,
    handlers: Arc<TaskHandlerRegistry>,
}

impl Worker {
    fn owns_queue(&self) -> bool {
        self.client
            .context()
            .route(&self.executor)
            .is_ok_and(|owner| &owner == self.client.local_id())
    }

    async fn run(self) {
        tracing::debug!(executor = %self.executor, "Worker {} started", self.worker_id);

        loop {
            if !self.owns_queue() {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            match self.queue.poll().await {
                Ok(Some(item)) => match serde_json::from_value::<Task>(item) {
                    Ok(task) => self.execute(task).await,
                    Err(e) => tracing::warn!(executor = %self.executor, "Dropped malformed task: {}", e),
                },
                Ok(None) => tokio::time::sleep(IDLE_POLL).await,
                Err(e) => {
                    tracing::warn!(executor = %self.executor, "Polling tasks failed: {}", e);
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }

    async fn execute(&self, task: Task) {
        tracing::info!(
            executor = %self.executor,
            task = %task.id,
            handler = %task.handler,
            "Worker {} running task",
            self.worker_id
        );
        let mut record = TaskRecord::pending(&task);
        record.status = TaskStatus::Running;
        record.assigned_to = Some(self.client.local_id().clone());
        self.store(&record).await;

        match self.handlers.execute(&task.handler, task.payload).await {
            Ok(result) => {
                record.status = TaskStatus::Completed;
                record.result = Some(result);
            }
            Err(e) => {
                tracing::warn!(task = %task.id, "Task failed: {}", e);
                record.status = TaskStatus::Failed {
                    error: e.to_string(),
                };
            }
        }
        record.finished_at_ms = Some(now_ms());
        self.store(&record).await;
    }

    async fn store(&self, record: &TaskRecord) {
        let stored = match serde_json::to_value(record) {
            Ok(value) => self
                .results
                .put_with_ttl(&record.task_id.0, value, self.result_ttl)
                .await
                .map(|_| ()),
            Err(e) => Err(GridError::from(e)),
        };
        if let Err(e) = stored {
            tracing::error!(task = %record.task_id, "Failed to store task record: {}", e);
        }
    }
}

/// Client handle for a named executor.
#[derive(Clone)]
pub struct DistributedExecutor {
    name: String,
    queue: DistributedQueue,
    results: DistributedMap,
    result_ttl: Duration,
    handlers: Arc<TaskHandlerRegistry>,
}

impl DistributedExecutor {
    pub fn new(
        name: &str,
        config: &ExecutorConfig,
        client: GridClient,
        handlers: Arc<TaskHandlerRegistry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            queue: DistributedQueue::new(name, client.clone()),
            results: DistributedMap::new(&results_map(name), client),
            result_ttl: config.result_ttl(),
            handlers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a task for `handler`. Fails with `Rejected` when the executor's queue
    /// is full.
    pub async fn submit(&self, handler: &str, payload: Value) -> GridResult<TaskId> {
        if !self.handlers.has_handler(handler) {
            return Err(GridError::UnknownHandler(handler.to_string()));
        }
        let task = Task {
            id: TaskId::new(),
            handler: handler.to_string(),
            payload,
            submitted_at_ms: now_ms(),
        };

        // Written before the offer, so a worker never finds its Running record replaced by Pending.
        let record = serde_json::to_value(TaskRecord::pending(&task))?;
        self.results
            .put_with_ttl(&task.id.0, record, self.result_ttl)
            .await?;

        if !self.queue.offer(serde_json::to_value(&task)?).await? {
            self.results.remove(&task.id.0).await?;
            return Err(GridError::Rejected {
                reason: format!("executor '{}' is at capacity", self.name),
            });
        }
        tracing::debug!(executor = %self.name, task = %task.id, "Submitted task");
        Ok(task.id)
    }

    pub async fn result(&self, task_id: &TaskId) -> GridResult<Option<TaskRecord>> {
        match self.results.get(&task_id.0).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Waits until the task has finished, up to `timeout`. Returns the last record
    /// seen, finished or not.
    pub async fn wait_for(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> GridResult<Option<TaskRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.result(task_id).await?;
            let finished = record.as_ref().is_some_and(|r| r.status.is_finished());
            if finished || tokio::time::Instant::now() >= deadline {
                return Ok(record);
            }
            tokio::time::sleep(RESULT_POLL).await;
        }
    }

    /// Tasks still queued.
    pub async fn pending(&self) -> GridResult<usize> {
        self.queue.size().await
    }
}
