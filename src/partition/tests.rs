//! Partition Module Tests
//!
//! ## Test Scopes
//! - **Key Routing**: `partition_for` is stable and in range; partition-aware keys
//!   are placed by their partition key.
//! - **Placement**: `rebalance` and `strip_dead` keep one owner per partition, bounded
//!   backups, balanced ownership and minimal movement.
//! - **Director**: stale membership events and stale tables are ignored.

#[cfg(test)]
mod tests {
    use crate::config::MigrationConfig;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{MembershipEvent, Node, NodeId};
    use crate::partition::table::{new_replicas, rebalance, strip_dead};
    use crate::partition::{
        PartitionAssignment, PartitionAwareKey, PartitionDirector, PartitionTable,
        partition_for, placement_key,
    };
    use crate::transport::LocalTransport;
    use std::net::SocketAddr;

    const PARTITIONS: u32 = 271;

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::from(*id)).collect()
    }

    fn assert_balanced(assignments: &[PartitionAssignment], live: &[NodeId]) {
        let mut counts: Vec<usize> = live
            .iter()
            .map(|n| assignments.iter().filter(|a| a.is_owner(n)).count())
            .collect();
        counts.sort_unstable();
        assert!(
            counts[counts.len() - 1] - counts[0] <= 1,
            "unbalanced owners: {:?}",
            counts
        );
    }

    fn table_of(assignments: Vec<PartitionAssignment>) -> PartitionTable {
        PartitionTable {
            version: 1,
            membership_version: 1,
            assignments,
        }
    }

    // ============================================================
    // KEY ROUTING TESTS
    // ============================================================

    #[test]
    fn test_partition_for_is_stable_and_in_range() {
        for i in 0..1_000 {
            let key = format!("key-{}", i);
            let p = partition_for(&key, PARTITIONS);
            assert!(p < PARTITIONS);
            assert_eq!(p, partition_for(&key, PARTITIONS));
        }
    }

    #[test]
    fn test_partition_for_spreads_keys() {
        let mut used = std::collections::HashSet::new();
        for i in 0..1_000 {
            used.insert(partition_for(&format!("user:{}", i), PARTITIONS));
        }
        assert!(used.len() > PARTITIONS as usize / 2);
    }

    #[test]
    fn test_keys_sharing_a_partition_key_are_colocated() {
        let customer = partition_for("customer-7", PARTITIONS);

        assert_eq!(partition_for("order-1@customer-7", PARTITIONS), customer);
        assert_eq!(partition_for("order-2@customer-7", PARTITIONS), customer);
        let spread: std::collections::HashSet<_> = (0..50)
            .map(|i| partition_for(&format!("order-{}", i), PARTITIONS))
            .collect();
        assert!(spread.len() > 1);
    }

    #[test]
    fn test_placement_key_needs_a_non_empty_suffix() {
        assert_eq!(placement_key("plain"), "plain");
        assert_eq!(placement_key("a@"), "a@");
        assert_eq!(placement_key("a@b@c"), "b@c");
        assert_eq!(placement_key("@group"), "group");
    }

    #[test]
    fn test_partition_aware_key_formats_as_routing_key() {
        let key = PartitionAwareKey::new("order-1", 42);

        assert_eq!(key.to_string(), "order-1@42");
        assert_eq!(
            partition_for(&key.to_string(), PARTITIONS),
            partition_for("42", PARTITIONS)
        );
    }

    // ============================================================
    // PLACEMENT TESTS
    // ============================================================

    #[test]
    fn test_initial_placement_satisfies_invariants() {
        let live = nodes(&["a", "b", "c", "d"]);
        let table = PartitionTable::new(PARTITIONS);

        let target = rebalance(&table.assignments, &live, 1);

        assert!(target.iter().all(|a| a.backups.len() == 1));
        assert_balanced(&target, &live);
        table_of(target).check_invariants(&live, 1).unwrap();
    }

    #[test]
    fn test_backups_are_capped_by_cluster_size() {
        let live = nodes(&["a", "b"]);
        let target = rebalance(&PartitionTable::new(PARTITIONS).assignments, &live, 3);

        assert!(target.iter().all(|a| a.backups.len() == 1));
        table_of(target).check_invariants(&live, 1).unwrap();

        let alone = nodes(&["a"]);
        let target = rebalance(&PartitionTable::new(PARTITIONS).assignments, &alone, 3);
        assert!(target.iter().all(|a| a.backups.is_empty()));
        assert!(target.iter().all(|a| a.is_owner(&alone[0])));
    }

    #[test]
    fn test_join_moves_only_the_new_nodes_share() {
        let before_live = nodes(&["a", "b", "c", "d"]);
        let before = rebalance(&PartitionTable::new(PARTITIONS).assignments, &before_live, 1);

        let after_live = nodes(&["a", "b", "c", "d", "e"]);
        let after = rebalance(&before, &after_live, 1);

        let moved = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| b.owner != a.owner)
            .count();
        assert!(moved <= PARTITIONS as usize / 5 + 1, "moved {}", moved);
        assert_balanced(&after, &after_live);
        table_of(after).check_invariants(&after_live, 1).unwrap();
    }

    #[test]
    fn test_strip_dead_promotes_first_backup() {
        let assignment = PartitionAssignment {
            partition: 7,
            owner: Some(NodeId::from("a")),
            backups: nodes(&["b", "c"]),
            incoming: nodes(&["a", "d"]),
        };

        let stripped = strip_dead(&[assignment], &nodes(&["b", "c", "d"]));

        assert_eq!(stripped[0].owner, Some(NodeId::from("b")));
        assert_eq!(stripped[0].backups, nodes(&["c"]));
        assert_eq!(stripped[0].incoming, nodes(&["d"]));
    }

    #[test]
    fn test_failure_keeps_every_partition_owned() {
        let live = nodes(&["a", "b", "c"]);
        let before = rebalance(&PartitionTable::new(PARTITIONS).assignments, &live, 1);

        let survivors = nodes(&["a", "c"]);
        let after = rebalance(&before, &survivors, 1);

        for (b, a) in before.iter().zip(after.iter()) {
            if b.owner.as_ref() != Some(&NodeId::from("b")) {
                // Surviving owners keep their data where possible.
                assert!(a.is_replica(b.owner.as_ref().unwrap()));
            }
        }
        assert_balanced(&after, &survivors);
        table_of(after).check_invariants(&survivors, 1).unwrap();
    }

    #[test]
    fn test_all_replicas_lost_leaves_partition_ownerless_until_rebalanced() {
        let assignment = PartitionAssignment {
            partition: 0,
            owner: Some(NodeId::from("a")),
            backups: Vec::new(),
            incoming: Vec::new(),
        };
        let live = nodes(&["b"]);

        let stripped = strip_dead(&[assignment.clone()], &live);
        assert_eq!(stripped[0].owner, None);

        let target = rebalance(&[assignment], &live, 1);
        assert_eq!(target[0].owner, Some(NodeId::from("b")));
    }

    #[test]
    fn test_new_replicas_lists_migration_destinations() {
        let current = PartitionAssignment {
            partition: 3,
            owner: Some(NodeId::from("a")),
            backups: nodes(&["b"]),
            incoming: Vec::new(),
        };
        let target = PartitionAssignment {
            partition: 3,
            owner: Some(NodeId::from("c")),
            backups: nodes(&["a"]),
            incoming: Vec::new(),
        };

        assert_eq!(new_replicas(&current, &target), nodes(&["c"]));
        assert!(new_replicas(&current, &current).is_empty());
    }

    #[test]
    fn test_check_invariants_rejects_duplicates() {
        let live = nodes(&["a", "b"]);
        let table = table_of(vec![PartitionAssignment {
            partition: 0,
            owner: Some(NodeId::from("a")),
            backups: nodes(&["a"]),
            incoming: Vec::new(),
        }]);

        assert!(table.check_invariants(&live, 1).is_err());
    }

    // ============================================================
    // DIRECTOR TESTS
    // ============================================================

    fn lone_director() -> std::sync::Arc<PartitionDirector> {
        let membership = MembershipService::detached(
            Node::new(
                NodeId::from("solo"),
                SocketAddr::from(([127, 0, 0, 1], 18_100)),
            ),
            "test",
        );
        PartitionDirector::new(
            16,
            1,
            MigrationConfig::default(),
            membership,
            LocalTransport::new(),
        )
    }

    #[tokio::test]
    async fn test_master_assigns_every_partition() {
        let director = lone_director();
        let event = MembershipEvent {
            version: 1,
            live_nodes: nodes(&["solo"]),
        };

        assert!(director.is_master(&event));
        assert!(director.on_membership_event(event).await);

        let table = director.table();
        assert!(table.version > 0);
        assert_eq!(table.membership_version, 1);
        assert_eq!(table.owned_by(&NodeId::from("solo")).len(), 16);
    }

    #[tokio::test]
    async fn test_stale_membership_event_is_discarded() {
        let director = lone_director();
        let live = nodes(&["solo"]);

        assert!(
            director
                .on_membership_event(MembershipEvent {
                    version: 2,
                    live_nodes: live.clone(),
                })
                .await
        );
        let version = director.table().version;

        assert!(
            !director
                .on_membership_event(MembershipEvent {
                    version: 1,
                    live_nodes: live,
                })
                .await
        );
        assert_eq!(director.table().version, version);
    }

    #[tokio::test]
    async fn test_non_master_does_not_publish() {
        let director = lone_director();
        let event = MembershipEvent {
            version: 1,
            live_nodes: nodes(&["alpha", "solo"]),
        };

        assert!(!director.is_master(&event));
        assert!(director.on_membership_event(event).await);
        assert_eq!(director.table().version, 0);
    }

    #[test]
    fn test_stale_table_is_rejected() {
        let director = lone_director();
        let mut newer = PartitionTable::new(16);
        newer.version = 5;
        assert_eq!(director.install(newer), 5);

        let mut older = PartitionTable::new(16);
        older.version = 4;
        older.assignments[0].owner = Some(NodeId::from("solo"));
        assert_eq!(director.install(older), 5);
        assert_eq!(director.table().owner_of(0), None);
    }
}
