//! Executor Module Tests
//!
//! ## Test Scopes
//! - **Registry**: handler registration, lookup and execution.
//! - **Data Types**: task status logic and record serialization.
//! - **Worker Pools**: tasks submitted on any node run on the queue owner; failures,
//!   unknown handlers and a full queue are reported to the submitter.
//! - **Results**: task records expire after the executor's result TTL.

#[cfg(test)]
mod tests {
    use crate::cluster::{ClusterContext, LocalCluster};
    use crate::config::{ExecutorConfig, GridConfig};
    use crate::error::GridError;
    use crate::executor::registry::TaskHandlerRegistry;
    use crate::executor::types::{Task, TaskId, TaskRecord, TaskStatus};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn grid_config(pool_size: usize, queue_capacity: usize) -> GridConfig {
        let mut config = GridConfig::development();
        config.partition_count = 16;
        config.executors.insert(
            "jobs".to_string(),
            ExecutorConfig {
                pool_size,
                queue_capacity,
                ..ExecutorConfig::default()
            },
        );
        config
    }

    fn register_handlers(node: &Arc<ClusterContext>) {
        node.handlers().register("double", |payload: Value| async move {
            let n = payload["n"]
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("Missing n"))?;
            Ok(json!(n * 2))
        });
        node.handlers().register("block", |_payload: Value| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Value::Null)
        });
    }

    async fn started(size: usize, config: GridConfig) -> LocalCluster {
        let cluster = LocalCluster::start(size, config).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(10)).await);
        for node in cluster.nodes() {
            register_handlers(node);
        }
        cluster
    }

    // ============================================================
    // REGISTRY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_registry_register_and_execute() {
        let registry = TaskHandlerRegistry::new();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        registry.register("count", move |payload: Value| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(payload)
            }
        });

        assert!(registry.has_handler("count"));
        assert_eq!(registry.handler_count(), 1);

        let result = registry.execute("count", json!({"echo": true})).await.unwrap();
        assert_eq!(result, json!({"echo": true}));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_unknown_handler_returns_error() {
        let registry = TaskHandlerRegistry::new();

        let result = registry.execute("non_existent_handler", Value::Null).await;

        let err = result.unwrap_err().to_string();
        assert!(err.contains("Unknown task handler"), "got: {}", err);
    }

    #[test]
    fn test_registry_lists_handlers_sorted() {
        let registry = TaskHandlerRegistry::new();
        registry.register("zeta", |_p: Value| async move { Ok(Value::Null) });
        registry.register("alpha", |_p: Value| async move { Ok(Value::Null) });

        assert_eq!(registry.list_handlers(), vec!["alpha", "zeta"]);
    }

    // ============================================================
    // DATA TYPE TESTS
    // ============================================================

    #[test]
    fn test_task_status_finished() {
        assert!(!TaskStatus::Pending.is_finished());
        assert!(!TaskStatus::Running.is_finished());
        assert!(TaskStatus::Completed.is_finished());
        assert!(
            TaskStatus::Failed {
                error: "boom".to_string()
            }
            .is_finished()
        );
    }

    #[test]
    fn test_pending_record_mirrors_task() {
        let task = Task {
            id: TaskId::new(),
            handler: "double".to_string(),
            payload: json!({"n": 1}),
            submitted_at_ms: 42,
        };

        let record = TaskRecord::pending(&task);
        let restored: TaskRecord =
            serde_json::from_value(serde_json::to_value(&record).unwrap()).unwrap();

        assert_eq!(restored, record);
        assert_eq!(record.task_id, task.id);
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.submitted_at_ms, 42);
        assert!(record.assigned_to.is_none());
    }

    // ============================================================
    // WORKER POOL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_task_runs_on_queue_owner() {
        let cluster = started(2, grid_config(2, 100)).await;
        let owner = cluster.first().unwrap().route("jobs").unwrap();
        let submitter = cluster
            .nodes()
            .iter()
            .find(|n| n.local_id() != &owner)
            .unwrap()
            .clone();
        let executor = submitter.executor("jobs");

        let id = executor.submit("double", json!({"n": 21})).await.unwrap();
        let record = executor
            .wait_for(&id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!(42)));
        assert_eq!(record.assigned_to, Some(owner));
        assert!(record.finished_at_ms.is_some());

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_handler_is_reported() {
        let cluster = started(1, grid_config(1, 100)).await;
        let executor = cluster.first().unwrap().executor("jobs");

        let id = executor.submit("double", json!({})).await.unwrap();
        let record = executor
            .wait_for(&id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        match record.status {
            TaskStatus::Failed { error } => assert!(error.contains("Missing n")),
            other => panic!("expected failure, got {:?}", other),
        }

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_handler_is_rejected_at_submit() {
        let cluster = started(1, grid_config(1, 100)).await;
        let executor = cluster.first().unwrap().executor("jobs");

        let result = executor.submit("missing", Value::Null).await;

        assert!(matches!(result, Err(GridError::UnknownHandler(_))));
        assert_eq!(executor.pending().await.unwrap(), 0);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let cluster = started(1, grid_config(1, 1)).await;
        let executor = cluster.first().unwrap().executor("jobs");

        // Occupy the only worker.
        let running = executor.submit("block", Value::Null).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = executor.result(&running).await.unwrap().unwrap();
            if record.status == TaskStatus::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let queued = executor.submit("block", Value::Null).await.unwrap();
        let rejected = executor.submit("block", Value::Null).await;

        assert!(matches!(rejected, Err(GridError::Rejected { .. })));
        assert_eq!(executor.pending().await.unwrap(), 1);
        assert_eq!(
            executor.result(&queued).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        cluster.shutdown().await;
    }

    // ============================================================
    // RESULT TESTS
    // ============================================================

    #[test]
    fn test_results_expire_after_an_hour_by_default() {
        let config = ExecutorConfig::default();
        assert_eq!(config.result_ttl(), Duration::from_secs(3_600));
        assert_eq!(
            ExecutorConfig {
                result_ttl_seconds: 0,
                ..config
            }
            .result_ttl(),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_finished_task_record_expires() {
        let mut config = grid_config(1, 100);
        if let Some(executor) = config.executors.get_mut("jobs") {
            executor.result_ttl_seconds = 1;
        }
        let cluster = started(1, config).await;
        let executor = cluster.first().unwrap().executor("jobs");

        let id = executor.submit("double", json!({"n": 1})).await.unwrap();
        let record = executor
            .wait_for(&id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskStatus::Completed);

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(executor.result(&id).await.unwrap(), None);
        cluster.shutdown().await;
    }
}
