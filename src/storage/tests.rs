//! Storage Module Tests
//!
//! ## Test Scopes
//! - **Map Semantics**: put/get/remove, conditional writes, entry processors and
//!   cluster-wide size, on a single embedded node.
//! - **Expiry & Eviction**: TTL (lazy and swept, expiry boundary, rounding) and
//!   size-bounded LRU eviction.
//! - **Partition Store**: backup-side idempotence and gap detection, migration
//!   buffering, stale snapshots, request deduplication, ownership checks and WAL
//!   recovery, on a store built by hand.
//! - **Replication Lanes**: retries stay inside the acknowledgment budget.

#[cfg(test)]
mod tests {
    use crate::cluster::{ClusterContext, LocalCluster};
    use crate::config::{ConfigRegistry, EvictionPolicy, GridConfig, MapConfig};
    use crate::error::GridError;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId};
    use crate::partition::{PartitionId, PartitionTable, partition_for};
    use crate::primitives::topic::TopicHub;
    use crate::storage::container::PartitionContainer;
    use crate::storage::map::{EntryProcessorRegistry, ProcessorOutcome, ttl_millis};
    use crate::storage::replication::Replicator;
    use crate::storage::store::PartitionStore;
    use crate::storage::types::{
        Entry, MapOperation, OpRecord, Operation, OperationResult, PartitionOp,
        PartitionSnapshot, QueueOperation,
    };
    use crate::transport::LocalTransport;
    use crate::wal::{FileWal, WriteAheadLog};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::time::Instant;

    const PARTITIONS: u32 = 16;

    fn grid_config() -> GridConfig {
        let mut config = GridConfig::development();
        config.partition_count = PARTITIONS;
        config
    }

    async fn single_node(config: GridConfig) -> (LocalCluster, Arc<ClusterContext>) {
        let cluster = LocalCluster::start(1, config).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(5)).await);
        let node = cluster.first().unwrap().clone();
        (cluster, node)
    }

    /// A store whose table says `local` owns every partition, with nothing to
    /// replicate to.
    fn standalone_store(
        wal: Option<Arc<dyn WriteAheadLog>>,
    ) -> (PartitionStore, watch::Sender<Arc<PartitionTable>>) {
        let local = NodeId::from("local");
        let mut table = PartitionTable::new(PARTITIONS);
        table.version = 1;
        for assignment in &mut table.assignments {
            assignment.owner = Some(local.clone());
        }
        let (table_tx, table_rx) = watch::channel(Arc::new(table));

        let configs = Arc::new(ConfigRegistry::new(grid_config()));
        let transport = LocalTransport::new();
        let membership = MembershipService::detached(
            Node::new(local.clone(), SocketAddr::from(([127, 0, 0, 1], 18_000))),
            "test",
        );
        let topics = TopicHub::new(membership, transport.clone(), configs.clone());
        let replicator = Arc::new(Replicator::new(
            local.clone(),
            transport,
            1,
            Duration::from_millis(100),
        ));
        let store = PartitionStore::new(
            local,
            table_rx,
            configs,
            EntryProcessorRegistry::new(),
            replicator,
            topics,
            wal,
        );
        (store, table_tx)
    }

    fn put_record(partition: PartitionId, seq: u64, key: &str, value: serde_json::Value) -> OpRecord {
        OpRecord {
            partition,
            seq,
            op: PartitionOp::MapPut {
                map: "m".to_string(),
                key: key.to_string(),
                value,
                ttl_ms: None,
                created_at_ms: 0,
            },
        }
    }

    async fn stored_value(store: &PartitionStore, partition: PartitionId, key: &str) -> Option<serde_json::Value> {
        store
            .inspect(partition, |slot| {
                slot.container
                    .map("m")
                    .ok()
                    .flatten()
                    .and_then(|records| records.get(key).map(|e| e.value.clone()))
            })
            .await
            .flatten()
    }

    // ============================================================
    // MAP SEMANTICS
    // ============================================================

    #[tokio::test]
    async fn test_put_get_remove() {
        let (cluster, node) = single_node(grid_config()).await;
        let users = node.map("users");

        assert_eq!(users.put("alice", json!({"age": 30})).await.unwrap(), None);
        assert_eq!(
            users.put("alice", json!({"age": 31})).await.unwrap(),
            Some(json!({"age": 30}))
        );
        assert_eq!(users.get("alice").await.unwrap(), Some(json!({"age": 31})));
        assert!(users.contains_key("alice").await.unwrap());

        assert_eq!(users.remove("alice").await.unwrap(), Some(json!({"age": 31})));
        assert_eq!(users.get("alice").await.unwrap(), None);
        assert_eq!(users.remove("alice").await.unwrap(), None);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_first_value() {
        let (cluster, node) = single_node(grid_config()).await;
        let map = node.map("settings");

        assert_eq!(map.put_if_absent("k", json!("v")).await.unwrap(), None);
        assert_eq!(
            map.put_if_absent("k", json!("v2")).await.unwrap(),
            Some(json!("v"))
        );
        assert_eq!(map.get("k").await.unwrap(), Some(json!("v")));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_replace_and_replace_if_version() {
        let (cluster, node) = single_node(grid_config()).await;
        let map = node.map("accounts");

        map.put("acc", json!(100)).await.unwrap();
        assert!(!map.replace("acc", json!(99), json!(0)).await.unwrap());
        assert!(map.replace("acc", json!(100), json!(150)).await.unwrap());

        let entry = map.get_entry("acc").await.unwrap().unwrap();
        assert_eq!(entry.value, json!(150));

        // A concurrent writer bumps the version first.
        map.put("acc", json!(175)).await.unwrap();
        assert!(!map.replace_if_version("acc", entry.version, json!(200)).await.unwrap());

        let fresh = map.get_entry("acc").await.unwrap().unwrap();
        assert!(fresh.version > entry.version);
        assert!(map.replace_if_version("acc", fresh.version, json!(200)).await.unwrap());
        assert_eq!(map.get("acc").await.unwrap(), Some(json!(200)));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_entry_processors() {
        let (cluster, node) = single_node(grid_config()).await;
        node.processors().register("increment", |_key, current, argument| {
            let next = current.and_then(|v| v.as_i64()).unwrap_or(0) + argument.as_i64().unwrap_or(1);
            ProcessorOutcome::set(json!(next), json!(next))
        });
        let counters = node.map("counters");

        assert_eq!(
            counters.execute_on_entry("hits", "increment", json!(5)).await.unwrap(),
            json!(5)
        );
        assert_eq!(
            counters.execute_on_entry("hits", "increment", json!(2)).await.unwrap(),
            json!(7)
        );

        for i in 0..10 {
            counters.put(&format!("c{}", i), json!(i)).await.unwrap();
        }
        let results = counters.execute_on_entries("increment", json!(1)).await.unwrap();
        assert_eq!(results.len(), 11);
        assert_eq!(results["c3"], json!(4));
        assert_eq!(counters.get("c9").await.unwrap(), Some(json!(10)));
        assert_eq!(counters.size().await.unwrap(), 11);

        let missing = counters.execute_on_entry("hits", "nope", json!(null)).await;
        assert!(matches!(missing, Err(GridError::UnknownProcessor(_))));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_name_is_bound_to_one_primitive_kind() {
        let (cluster, node) = single_node(grid_config()).await;

        // The queue "jobs" and the key "jobs" of map "jobs" share a partition.
        assert!(node.queue("jobs").offer(json!(1)).await.unwrap());
        let result = node.map("jobs").put("jobs", json!(1)).await;
        assert!(matches!(result, Err(GridError::WrongPrimitive { .. })));

        cluster.shutdown().await;
    }

    // ============================================================
    // EXPIRY & EVICTION
    // ============================================================

    #[tokio::test]
    async fn test_ttl_entry_disappears() {
        let mut config = grid_config();
        config.maps.insert(
            "sessions".to_string(),
            MapConfig {
                backup_count: 0,
                ttl_seconds: 1,
                ..MapConfig::default()
            },
        );
        let (cluster, node) = single_node(config).await;
        let sessions = node.map("sessions");

        sessions.put("s1", json!("token")).await.unwrap();
        sessions
            .put_with_ttl("pinned", json!("forever"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(sessions.get("s1").await.unwrap(), Some(json!("token")));

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sessions.get("s1").await.unwrap(), None);
        assert_eq!(sessions.get("pinned").await.unwrap(), Some(json!("forever")));
        assert_eq!(sessions.size().await.unwrap(), 1);

        cluster.shutdown().await;
    }

    #[test]
    fn test_entry_expires_only_past_its_ttl() {
        let entry = Entry {
            key: "k".to_string(),
            value: json!(1),
            version: 1,
            created_at_ms: 1_000,
            ttl_ms: Some(50),
            last_access: 0,
            hits: 0,
        };

        assert!(!entry.is_expired(1_049));
        assert!(!entry.is_expired(1_050));
        assert!(entry.is_expired(1_051));
        assert!(
            !Entry {
                ttl_ms: None,
                ..entry
            }
            .is_expired(u64::MAX)
        );
    }

    #[test]
    fn test_sub_millisecond_ttl_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_micros(500)), 1);
        assert_eq!(ttl_millis(Duration::from_micros(1_500)), 2);
        assert_eq!(ttl_millis(Duration::from_millis(3)), 3);
        assert_eq!(ttl_millis(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn test_lru_keeps_max_size_entries() {
        let mut config = grid_config();
        config.eviction_sweep_interval_ms = 60_000;
        config.maps.insert(
            "lru".to_string(),
            MapConfig {
                backup_count: 0,
                eviction_policy: EvictionPolicy::Lru,
                max_size: 2,
                ..MapConfig::default()
            },
        );
        let (cluster, node) = single_node(config).await;
        let lru = node.map("lru");

        lru.put("a", json!(1)).await.unwrap();
        lru.put("b", json!(2)).await.unwrap();
        lru.get("a").await.unwrap();
        lru.put("c", json!(3)).await.unwrap();

        let evicted = node.eviction().sweep_now("lru").await.unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(lru.size().await.unwrap(), 2);
        assert_eq!(lru.get("b").await.unwrap(), None);
        assert!(lru.contains_key("a").await.unwrap());
        assert!(lru.contains_key("c").await.unwrap());

        cluster.shutdown().await;
    }

    // ============================================================
    // PARTITION STORE
    // ============================================================

    #[tokio::test]
    async fn test_apply_replica_is_idempotent() {
        let (store, _table) = standalone_store(None);

        store.apply_replica(put_record(3, 1, "k", json!("a"))).await.unwrap();
        store.apply_replica(put_record(3, 2, "k", json!("b"))).await.unwrap();
        // Redelivery of an older record changes nothing.
        store.apply_replica(put_record(3, 1, "k", json!("a"))).await.unwrap();

        assert_eq!(stored_value(&store, 3, "k").await, Some(json!("b")));
        assert_eq!(store.inspect(3, |slot| slot.seq).await, Some(2));
    }

    #[tokio::test]
    async fn test_apply_replica_rejects_a_gap() {
        let (store, _table) = standalone_store(None);
        store.apply_replica(put_record(4, 1, "a", json!(1))).await.unwrap();

        let result = store.apply_replica(put_record(4, 3, "c", json!(3))).await;

        match result {
            Err(GridError::ReplicaGap {
                partition,
                expected,
                received,
            }) => {
                assert_eq!((partition, expected, received), (4, 2, 3));
            }
            other => panic!("expected ReplicaGap, got {:?}", other),
        }
        assert_eq!(stored_value(&store, 4, "c").await, None);
        assert_eq!(store.inspect(4, |slot| slot.seq).await, Some(1));
    }

    #[tokio::test]
    async fn test_active_slot_ignores_stale_snapshot() {
        let (store, _table) = standalone_store(None);
        store.apply_replica(put_record(6, 1, "k", json!("a"))).await.unwrap();
        store.apply_replica(put_record(6, 2, "k", json!("b"))).await.unwrap();

        let mut container = PartitionContainer::default();
        container
            .apply(&put_record(6, 1, "k", json!("a")).op, 1, 0)
            .unwrap();
        store
            .install_snapshot(PartitionSnapshot {
                partition: 6,
                seq: 1,
                container,
            })
            .await
            .unwrap();

        assert_eq!(stored_value(&store, 6, "k").await, Some(json!("b")));
        assert_eq!(store.inspect(6, |slot| slot.seq).await, Some(2));
    }

    #[tokio::test]
    async fn test_repeated_request_is_answered_from_the_log() {
        let (store, _table) = standalone_store(None);
        let partition = partition_for("jobs", PARTITIONS);
        let offer = Operation::Queue {
            queue: "jobs".to_string(),
            op: QueueOperation::Offer { item: json!("job-1") },
        };
        let size = Operation::Queue {
            queue: "jobs".to_string(),
            op: QueueOperation::Size,
        };

        let first = store
            .execute_request(partition, Some("req-1"), &offer)
            .await
            .unwrap();
        let repeated = store
            .execute_request(partition, Some("req-1"), &offer)
            .await
            .unwrap();

        assert_eq!(first, OperationResult::Bool(true));
        assert_eq!(repeated, first);
        assert_eq!(store.execute(partition, &size).await.unwrap(), OperationResult::Size(1));

        store
            .execute_request(partition, Some("req-2"), &offer)
            .await
            .unwrap();
        assert_eq!(store.execute(partition, &size).await.unwrap(), OperationResult::Size(2));
    }

    #[tokio::test]
    async fn test_repeated_put_keeps_its_first_result() {
        let (store, _table) = standalone_store(None);
        let partition = partition_for("k", PARTITIONS);
        let put = Operation::Map {
            map: "m".to_string(),
            key: "k".to_string(),
            op: MapOperation::Put {
                value: json!("v"),
                ttl_ms: None,
            },
        };

        for _ in 0..2 {
            let result = store
                .execute_request(partition, Some("put-1"), &put)
                .await
                .unwrap();
            assert_eq!(result, OperationResult::Value(None));
        }
        assert_eq!(store.inspect(partition, |slot| slot.seq).await, Some(2));
    }

    #[tokio::test]
    async fn test_migration_buffers_until_snapshot() {
        let (store, _table) = standalone_store(None);

        store.begin_migration(5).await.unwrap();
        store.apply_replica(put_record(5, 3, "late", json!(3))).await.unwrap();
        store.apply_replica(put_record(5, 2, "old", json!(2))).await.unwrap();
        assert!(matches!(
            store.snapshot(5).await,
            Err(GridError::PartitionUnavailable { partition: 5 })
        ));

        let mut container = PartitionContainer::default();
        container
            .apply(&put_record(5, 2, "old", json!("from-snapshot")).op, 2, 0)
            .unwrap();
        store
            .install_snapshot(PartitionSnapshot {
                partition: 5,
                seq: 2,
                container,
            })
            .await
            .unwrap();

        assert_eq!(stored_value(&store, 5, "old").await, Some(json!("from-snapshot")));
        assert_eq!(stored_value(&store, 5, "late").await, Some(json!(3)));
        assert_eq!(store.snapshot(5).await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_execute_rejects_partitions_owned_elsewhere() {
        let (store, table_tx) = standalone_store(None);
        let key = "some-key";
        let partition = partition_for(key, PARTITIONS);

        let mut table = (**table_tx.borrow()).clone();
        table.version += 1;
        table.assignments[partition as usize].owner = Some(NodeId::from("other"));
        table_tx.send(Arc::new(table)).unwrap();

        let op = Operation::Map {
            map: "m".to_string(),
            key: key.to_string(),
            op: MapOperation::Get,
        };
        match store.execute(partition, &op).await {
            Err(GridError::NotOwner { partition: p, owner }) => {
                assert_eq!(p, partition);
                assert_eq!(owner, Some(NodeId::from("other")));
            }
            other => panic!("expected NotOwner, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recover_from_file_wal() {
        let dir = tempfile::tempdir().unwrap();
        let key = "durable";
        let partition = partition_for(key, PARTITIONS);
        let put = Operation::Map {
            map: "m".to_string(),
            key: key.to_string(),
            op: MapOperation::Put {
                value: json!("v1"),
                ttl_ms: None,
            },
        };

        {
            let wal: Arc<dyn WriteAheadLog> = Arc::new(FileWal::open(dir.path()).unwrap());
            let (store, _table) = standalone_store(Some(wal));
            let result = store.execute(partition, &put).await.unwrap();
            assert_eq!(result, OperationResult::Value(None));
        }

        let wal: Arc<dyn WriteAheadLog> = Arc::new(FileWal::open(dir.path()).unwrap());
        let (store, _table) = standalone_store(Some(wal));
        assert_eq!(store.recover().await.unwrap(), 1);
        assert_eq!(stored_value(&store, partition, key).await, Some(json!("v1")));

        // Replaying twice leaves the same state.
        store.recover().await.unwrap();
        assert_eq!(store.inspect(partition, |slot| slot.seq).await, Some(1));
    }

    // ============================================================
    // REPLICATION LANES
    // ============================================================

    #[tokio::test]
    async fn test_failed_delivery_resolves_within_budget() {
        let transport = LocalTransport::new();
        let replicator = Replicator::new(
            NodeId::from("owner"),
            transport,
            3,
            Duration::from_millis(300),
        );
        let started = Instant::now();

        let acks = replicator.enqueue(
            put_record(1, 1, "k", json!(1)),
            &[NodeId::from("ghost")],
            &[],
        );
        let delivered = futures::future::join_all(acks).await;

        assert_eq!(delivered.len(), 1);
        assert!(matches!(delivered[0], Ok(false)));
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "took {:?}",
            started.elapsed()
        );
    }
}
