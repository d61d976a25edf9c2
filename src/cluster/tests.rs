//! Cluster Module Tests
//!
//! ## Test Scopes
//! - **Routing**: any node reaches any key through the gateway; keys sharing a
//!   partition key land in one partition.
//! - **Replication**: a dead sync backup fails the write, a backup that missed
//!   records is resent the partition, async backups catch up.
//! - **Failover**: a crashed owner's partitions are served by the promoted backup,
//!   and a repeated request is answered from the replicated request log.
//! - **Migration**: data moves to a joining node without loss, also when the source
//!   dies mid-migration; a newer view does not wait for stuck migrations.
//! - **Locks**: mutual exclusion across nodes, release on holder crash and fast
//!   failure without a quorum.
//! - **HTTP**: status mapping and the client routes over a real listener.

#[cfg(test)]
mod tests {
    use crate::cluster::handlers::{client_routes, status_of};
    use crate::cluster::{ClusterContext, LocalCluster};
    use crate::config::GridConfig;
    use crate::error::GridError;
    use crate::membership::types::NodeId;
    use crate::partition::{PartitionAwareKey, PartitionId};
    use crate::storage::container::PartitionContainer;
    use crate::storage::types::{
        Invocation, MapOperation, Operation, OperationResult, PartitionSnapshot, QueueOperation,
    };
    use crate::transport::InboundHandler;
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Synchronous backups of one copy.
    fn replicated_config() -> GridConfig {
        let mut config = GridConfig::default();
        config.partition_count = 32;
        config
    }

    async fn started(size: usize, config: GridConfig) -> LocalCluster {
        let cluster = LocalCluster::start(size, config).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(10)).await);
        cluster
    }

    /// Sequence and sorted keys of `map` in a node's copy of `partition`.
    async fn slot_contents(
        node: &ClusterContext,
        partition: PartitionId,
        map: &str,
    ) -> (u64, Vec<String>) {
        node.store()
            .inspect(partition, |slot| {
                let mut keys: Vec<String> = slot
                    .container
                    .map(map)
                    .ok()
                    .flatten()
                    .map(|records| records.entries.keys().cloned().collect())
                    .unwrap_or_default();
                keys.sort();
                (slot.seq, keys)
            })
            .await
            .unwrap_or_default()
    }

    /// Owner and first backup of the partition holding `key`.
    fn replicas_of(cluster: &LocalCluster, key: &str) -> (Arc<ClusterContext>, Arc<ClusterContext>) {
        let any = cluster.first().unwrap();
        let table = any.table();
        let assignment = table.assignment(any.partition_of(key)).unwrap();
        let owner = cluster.node(assignment.owner.as_ref().unwrap()).unwrap().clone();
        let backup = cluster.node(&assignment.backups[0]).unwrap().clone();
        (owner, backup)
    }

    /// Another key of the partition holding `key`.
    fn same_partition_key(node: &ClusterContext, key: &str) -> String {
        let partition = node.partition_of(key);
        (1..)
            .map(|i| format!("{}-{}", key, i))
            .find(|k| node.partition_of(k) == partition)
            .unwrap()
    }

    fn reconnect(cluster: &LocalCluster, node: &Arc<ClusterContext>) {
        let handler: Arc<dyn InboundHandler> = node.clone();
        cluster.transport().register(&handler);
    }

    // ============================================================
    // ROUTING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_any_node_reaches_any_key() {
        let cluster = started(3, replicated_config()).await;

        for (i, node) in cluster.nodes().iter().enumerate() {
            node.map("users")
                .put(&format!("user-{}", i), json!({ "writer": i }))
                .await
                .unwrap();
        }
        for node in cluster.nodes() {
            let users = node.map("users");
            for i in 0..cluster.nodes().len() {
                assert_eq!(
                    users.get(&format!("user-{}", i)).await.unwrap(),
                    Some(json!({ "writer": i }))
                );
            }
            assert_eq!(users.size().await.unwrap(), 3);
        }

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_owner_refuses_direct_submit() {
        let cluster = started(2, replicated_config()).await;
        let owner = cluster.first().unwrap().route("direct").unwrap();
        let other = cluster
            .nodes()
            .iter()
            .find(|n| n.local_id() != &owner)
            .unwrap();

        let result = other
            .submit(Operation::Map {
                map: "m".to_string(),
                key: "direct".to_string(),
                op: MapOperation::Get,
            })
            .await;

        assert!(matches!(result, Err(GridError::NotOwner { .. })));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_partition_aware_keys_share_a_partition() {
        let cluster = started(3, replicated_config()).await;
        let node = cluster.first().unwrap();
        let orders = node.map("orders");
        let first = PartitionAwareKey::new("order-1", "customer-7").to_string();
        let second = PartitionAwareKey::new("order-2", "customer-7").to_string();

        orders.put(&first, json!(1)).await.unwrap();
        orders.put(&second, json!(2)).await.unwrap();

        let partition = node.partition_of("customer-7");
        assert_eq!(node.partition_of(&first), partition);
        let owner_id = node.table().owner_of(partition).cloned().unwrap();
        let owner = cluster.node(&owner_id).unwrap();
        let (_, keys) = slot_contents(owner, partition, "orders").await;
        assert_eq!(keys, vec![first.clone(), second.clone()]);
        assert_eq!(orders.get(&second).await.unwrap(), Some(json!(2)));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_left_node_rejects_operations() {
        let cluster = started(1, replicated_config()).await;
        let node = cluster.first().unwrap().clone();

        node.leave().await;
        node.leave().await;

        assert!(node.is_shutting_down());
        let result = node.map("m").get("k").await;
        assert!(matches!(result, Err(GridError::ShuttingDown)));
    }

    // ============================================================
    // REPLICATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_dead_sync_backup_times_out_the_write() {
        let mut config = replicated_config();
        config.replication.timeout_ms = 300;
        let cluster = started(2, config).await;
        let (owner, backup) = replicas_of(&cluster, "k0");

        cluster.transport().disconnect(backup.local_id());
        let started_at = Instant::now();
        let result = owner.map("m").put("k0", json!(0)).await;

        assert!(
            matches!(result, Err(GridError::ReplicationTimeout { .. })),
            "got {:?}",
            result
        );
        assert!(started_at.elapsed() < Duration::from_secs(1));
        // The owner keeps the write it could not replicate.
        assert_eq!(owner.map("m").get("k0").await.unwrap(), Some(json!(0)));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_backup_recovers_records_missed_during_outage() {
        let mut config = replicated_config();
        config.replication.timeout_ms = 300;
        let cluster = started(2, config).await;
        let (owner, backup) = replicas_of(&cluster, "k0");
        let partition = owner.partition_of("k0");
        let later = same_partition_key(&owner, "k0");

        cluster.transport().disconnect(backup.local_id());
        assert!(owner.map("m").put("k0", json!(0)).await.is_err());
        reconnect(&cluster, &backup);

        assert_eq!(owner.map("m").put(&later, json!(1)).await.unwrap(), None);

        let on_owner = slot_contents(&owner, partition, "m").await;
        let on_backup = slot_contents(&backup, partition, "m").await;
        assert_eq!(on_owner.1, {
            let mut keys = vec!["k0".to_string(), later.clone()];
            keys.sort();
            keys
        });
        assert_eq!(on_backup, on_owner);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_backup_reporting_a_gap_is_resent_the_partition() {
        let cluster = started(2, replicated_config()).await;
        let (owner, backup) = replicas_of(&cluster, "k0");
        let partition = owner.partition_of("k0");
        let later = same_partition_key(&owner, "k0");
        owner.map("m").put("k0", json!(0)).await.unwrap();

        // The backup loses its copy and starts over from an empty partition.
        backup.store().begin_migration(partition).await.unwrap();
        backup
            .store()
            .install_snapshot(PartitionSnapshot {
                partition,
                seq: 0,
                container: PartitionContainer::default(),
            })
            .await
            .unwrap();
        assert_eq!(slot_contents(&backup, partition, "m").await, (0, Vec::new()));

        owner.map("m").put(&later, json!(1)).await.unwrap();

        let on_owner = slot_contents(&owner, partition, "m").await;
        assert_eq!(on_owner.1.len(), 2);
        assert_eq!(slot_contents(&backup, partition, "m").await, on_owner);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_async_backups_receive_every_write() {
        let mut config = replicated_config();
        config.default_map.backup_count = 0;
        config.default_map.async_backup_count = 1;
        let mut cluster = started(2, config).await;
        let writer = cluster.first().unwrap().map("events");
        let keys: Vec<String> = (0..20).map(|i| format!("ev-{}", i)).collect();
        for (i, key) in keys.iter().enumerate() {
            writer.put(key, json!(i)).await.unwrap();
        }

        for key in &keys {
            let (_, backup) = replicas_of(&cluster, key);
            let partition = backup.partition_of(key);
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let (_, held) = slot_contents(&backup, partition, "events").await;
                if held.contains(key) {
                    break;
                }
                assert!(Instant::now() < deadline, "{} never reached its backup", key);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        cluster.kill_node(&NodeId::from("node-02")).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(10)).await);
        let events = cluster.first().unwrap().map("events");
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(events.get(key).await.unwrap(), Some(json!(i)));
        }

        cluster.shutdown().await;
    }

    // ============================================================
    // FAILOVER & MIGRATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_repeated_request_survives_failover() {
        let mut cluster = started(3, replicated_config()).await;
        let owner_id = cluster.first().unwrap().route("orders").unwrap();
        let owner = cluster.node(&owner_id).unwrap().clone();
        let offer = Invocation::new(Operation::Queue {
            queue: "orders".to_string(),
            op: QueueOperation::Offer { item: json!("o-1") },
        });

        let first = owner.submit_invocation(offer.clone()).await.unwrap();
        assert_eq!(first, OperationResult::Bool(true));
        cluster.kill_node(&owner_id).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(10)).await);

        let new_owner_id = cluster.first().unwrap().route("orders").unwrap();
        assert_ne!(new_owner_id, owner_id);
        let new_owner = cluster.node(&new_owner_id).unwrap().clone();
        let repeated = new_owner.submit_invocation(offer).await.unwrap();

        assert_eq!(repeated, first);
        assert_eq!(new_owner.queue("orders").size().await.unwrap(), 1);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_owner_crash_promotes_backup_without_data_loss() {
        let mut cluster = started(3, replicated_config()).await;
        let writer = cluster.first().unwrap().map("accounts");
        for i in 0..100 {
            writer.put(&format!("acc-{}", i), json!(i)).await.unwrap();
        }

        let victim = NodeId::from("node-02");
        let owned_by_victim = cluster.first().unwrap().table().owned_by(&victim);
        assert!(!owned_by_victim.is_empty());
        cluster.kill_node(&victim).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(10)).await);

        let table = cluster.first().unwrap().table();
        assert!(table.owned_by(&victim).is_empty());
        for node in cluster.nodes() {
            let accounts = node.map("accounts");
            for i in 0..100 {
                assert_eq!(
                    accounts.get(&format!("acc-{}", i)).await.unwrap(),
                    Some(json!(i)),
                    "acc-{} lost",
                    i
                );
            }
        }

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_migrates_partitions_with_their_data() {
        let mut cluster = started(2, replicated_config()).await;
        let writer = cluster.first().unwrap().map("catalog");
        for i in 0..200 {
            writer.put(&format!("item-{}", i), json!({ "n": i })).await.unwrap();
        }
        let queue = cluster.first().unwrap().queue("inbox");
        for i in 0..5 {
            queue.offer(json!(i)).await.unwrap();
        }

        let joined = cluster.add_node().await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(15)).await);

        assert!(!joined.table().owned_by(joined.local_id()).is_empty());
        let catalog = joined.map("catalog");
        assert_eq!(catalog.size().await.unwrap(), 200);
        for i in 0..200 {
            assert_eq!(
                catalog.get(&format!("item-{}", i)).await.unwrap(),
                Some(json!({ "n": i }))
            );
        }
        let inbox = joined.queue("inbox");
        for i in 0..5 {
            assert_eq!(inbox.poll().await.unwrap(), Some(json!(i)));
        }

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_migration_source_dying_midway_loses_nothing() {
        let mut config = replicated_config();
        config.migration.max_attempts = 50;
        config.migration.backoff_base_ms = 100;
        config.migration.backoff_max_ms = 200;
        let mut cluster = started(2, config).await;
        let writer = cluster.first().unwrap().map("catalog");
        for i in 0..100 {
            writer.put(&format!("item-{}", i), json!(i)).await.unwrap();
        }

        let joined = cluster.add_node().await.unwrap();
        // node-02 stops answering while still counted as alive, so migrations it
        // sources keep failing until it is declared dead.
        let source = NodeId::from("node-02");
        cluster.transport().disconnect(&source);
        tokio::time::sleep(Duration::from_millis(200)).await;
        cluster.kill_node(&source).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(15)).await);

        let catalog = joined.map("catalog");
        assert_eq!(catalog.size().await.unwrap(), 100);
        for i in 0..100 {
            assert_eq!(
                catalog.get(&format!("item-{}", i)).await.unwrap(),
                Some(json!(i)),
                "item-{} lost",
                i
            );
        }

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_promotion_does_not_wait_for_stuck_migrations() {
        let mut config = replicated_config();
        config.migration.backoff_base_ms = 2_000;
        config.migration.backoff_max_ms = 2_000;
        let mut cluster = started(3, config).await;

        cluster.add_node().await.unwrap();
        // Migrations sourced from node-02 now back off for seconds.
        cluster.transport().disconnect(&NodeId::from("node-02"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let victim = NodeId::from("node-03");
        assert!(!cluster.first().unwrap().table().owned_by(&victim).is_empty());
        cluster.kill_node(&victim).await.unwrap();

        let master = cluster.first().unwrap().clone();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !master.table().owned_by(&victim).is_empty() {
            assert!(
                Instant::now() < deadline,
                "partitions of the dead node were not promoted in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cluster.shutdown().await;
    }

    // ============================================================
    // LOCK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_exactly_one_node_wins_the_lock() {
        let cluster = started(4, replicated_config()).await;
        cluster.first().unwrap().cp().wait_for_leader(Duration::from_secs(5)).await.unwrap();

        let attempts: Vec<_> = cluster
            .nodes()
            .iter()
            .map(|node| {
                let cp = node.cp().clone();
                tokio::spawn(async move {
                    let session = cp.create_session().await.unwrap();
                    cp.try_lock("leader-election", &session, Duration::ZERO)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_holder_releases_lock_after_lease() {
        let mut config = replicated_config();
        config.cp.session_lease_ms = 500;
        let mut cluster = started(4, config).await;
        cluster.first().unwrap().cp().wait_for_leader(Duration::from_secs(5)).await.unwrap();

        // node-04 is outside the coordination group and forwards its calls.
        let holder_node = cluster.node(&NodeId::from("node-04")).unwrap().clone();
        assert!(!holder_node.cp().is_member());
        let holder = holder_node.cp().create_session().await.unwrap();
        let keep_alive = holder_node.cp().keep_alive(&holder);
        assert!(
            holder_node
                .cp()
                .try_lock("jobs", &holder, Duration::ZERO)
                .await
                .unwrap()
        );

        let cp = cluster.first().unwrap().cp().clone();
        let waiter = cp.create_session().await.unwrap();
        let waiter_alive = cp.keep_alive(&waiter);
        assert!(!cp.try_lock("jobs", &waiter, Duration::from_millis(700)).await.unwrap());

        cluster.kill_node(holder_node.local_id()).await.unwrap();
        keep_alive.abort();

        assert!(cp.try_lock("jobs", &waiter, Duration::from_secs(5)).await.unwrap());
        assert_eq!(cp.lock_state("jobs").await.unwrap().holder, Some(waiter));

        waiter_alive.abort();
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_try_lock_without_quorum_fails_fast() {
        let mut cluster = started(3, replicated_config()).await;
        let cp = cluster.first().unwrap().cp().clone();
        cp.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        let session = cp.create_session().await.unwrap();

        cluster.kill_node(&NodeId::from("node-02")).await.unwrap();
        cluster.kill_node(&NodeId::from("node-03")).await.unwrap();
        let started_at = Instant::now();
        let result = cp.try_lock("L", &session, Duration::from_millis(100)).await;

        assert!(
            matches!(result, Err(GridError::ConsensusUnavailable)),
            "got {:?}",
            result
        );
        assert!(
            started_at.elapsed() < Duration::from_secs(1),
            "took {:?}",
            started_at.elapsed()
        );

        cluster.shutdown().await;
    }

    // ============================================================
    // HTTP TESTS
    // ============================================================

    #[test]
    fn test_error_status_mapping() {
        let not_owner = GridError::NotOwner {
            partition: 1,
            owner: None,
        };
        assert_eq!(status_of(&not_owner), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of(&GridError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_of(&GridError::UnknownHandler("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&GridError::Rejected {
                reason: "full".to_string()
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_client_routes_over_http() {
        let cluster = started(1, replicated_config()).await;
        let app = client_routes(cluster.first().unwrap().clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let http = reqwest::Client::new();
        let base = format!("http://{}", addr);

        let put: Value = http
            .put(format!("{}/maps/users/entries/alice", base))
            .json(&json!({ "value": { "age": 30 } }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(put["previous"], Value::Null);

        let entry: Value = http
            .get(format!("{}/maps/users/entries/alice", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(entry["value"], json!({ "age": 30 }));

        let offer = http
            .post(format!("{}/queues/work/offer", base))
            .json(&json!({ "item": "job-1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(offer.status(), reqwest::StatusCode::OK);

        let unknown = http
            .post(format!("{}/executors/none/tasks", base))
            .json(&json!({ "handler": "missing" }))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::BAD_REQUEST);

        server.abort();
        cluster.shutdown().await;
    }
}
