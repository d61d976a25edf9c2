//! Primitives Module Tests
//!
//! ## Test Scopes
//! - **Queue Log**: offer/poll application and replay idempotence.
//! - **Distributed Queue**: FIFO order, empty polls, peek/size and capacity.
//! - **Topics**: delivery order across nodes, retained log and listeners.

#[cfg(test)]
mod tests {
    use crate::cluster::LocalCluster;
    use crate::config::{GridConfig, QueueConfig, TopicConfig};
    use crate::primitives::queue::QueueLog;
    use crate::primitives::topic::TopicMessage;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn grid_config() -> GridConfig {
        let mut config = GridConfig::development();
        config.partition_count = 16;
        config
    }

    async fn started(size: usize, config: GridConfig) -> LocalCluster {
        let cluster = LocalCluster::start(size, config).await.unwrap();
        assert!(cluster.await_stable(Duration::from_secs(10)).await);
        cluster
    }

    async fn next_message(rx: &mut broadcast::Receiver<TopicMessage>) -> TopicMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no message within 5s")
            .unwrap()
    }

    // ============================================================
    // QUEUE LOG TESTS
    // ============================================================

    #[test]
    fn test_queue_log_ignores_replayed_offers() {
        let mut log = QueueLog::default();
        log.apply_offer(1, json!("a"));
        log.apply_offer(2, json!("b"));
        log.apply_offer(1, json!("a"));

        assert_eq!(log.len(), 2);
        assert_eq!(log.head().unwrap().value, json!("a"));
    }

    #[test]
    fn test_queue_log_poll_removes_exact_item() {
        let mut log = QueueLog::default();
        log.apply_offer(1, json!("a"));
        log.apply_offer(2, json!("b"));

        log.apply_poll(1);
        log.apply_poll(1);

        assert_eq!(log.len(), 1);
        assert_eq!(log.head().unwrap().seq, 2);
    }

    // ============================================================
    // DISTRIBUTED QUEUE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let cluster = started(1, grid_config()).await;
        let queue = cluster.first().unwrap().queue("work");

        for item in ["a", "b", "c"] {
            assert!(queue.offer(json!(item)).await.unwrap());
        }
        assert_eq!(queue.size().await.unwrap(), 3);
        assert_eq!(queue.peek().await.unwrap(), Some(json!("a")));

        assert_eq!(queue.poll().await.unwrap(), Some(json!("a")));
        assert_eq!(queue.poll().await.unwrap(), Some(json!("b")));
        assert_eq!(queue.poll().await.unwrap(), Some(json!("c")));
        assert_eq!(queue.poll().await.unwrap(), None);
        assert_eq!(queue.size().await.unwrap(), 0);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_rejects_offers_past_capacity() {
        let mut config = grid_config();
        config.queues.insert(
            "bounded".to_string(),
            QueueConfig {
                backup_count: 0,
                async_backup_count: 0,
                max_size: 2,
            },
        );
        let cluster = started(1, config).await;
        let queue = cluster.first().unwrap().queue("bounded");

        assert!(queue.offer(json!(1)).await.unwrap());
        assert!(queue.offer(json!(2)).await.unwrap());
        assert!(!queue.offer(json!(3)).await.unwrap());

        queue.poll().await.unwrap();
        assert!(queue.offer(json!(3)).await.unwrap());

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_is_shared_across_nodes() {
        let cluster = started(2, grid_config()).await;
        let a = cluster.nodes()[0].queue("shared");
        let b = cluster.nodes()[1].queue("shared");

        a.offer(json!("from-a")).await.unwrap();
        b.offer(json!("from-b")).await.unwrap();

        assert_eq!(b.poll().await.unwrap(), Some(json!("from-a")));
        assert_eq!(a.poll().await.unwrap(), Some(json!("from-b")));

        cluster.shutdown().await;
    }

    // ============================================================
    // TOPIC TESTS
    // ============================================================

    #[tokio::test]
    async fn test_global_ordering_delivers_in_sequence_order() {
        let mut config = grid_config();
        config.topics.insert(
            "orders".to_string(),
            TopicConfig {
                global_ordering_enabled: true,
                ..TopicConfig::default()
            },
        );
        let cluster = started(2, config).await;
        let mut rx = cluster.nodes()[1].topic("orders").subscribe();

        let publishers: Vec<_> = cluster
            .nodes()
            .iter()
            .map(|node| {
                let topic = node.topic("orders");
                tokio::spawn(async move {
                    for i in 0..10 {
                        topic.publish(json!(i)).await.unwrap();
                    }
                })
            })
            .collect();
        for publisher in publishers {
            publisher.await.unwrap();
        }

        let mut sequences = Vec::new();
        for _ in 0..20 {
            sequences.push(next_message(&mut rx).await.sequence);
        }
        assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_ordering_keeps_publisher_order() {
        let cluster = started(2, grid_config()).await;
        let mut rx = cluster.nodes()[1].topic("news").subscribe();
        let topic = cluster.nodes()[0].topic("news");

        for i in 0..5 {
            topic.publish(json!({ "n": i })).await.unwrap();
        }

        for i in 0..5 {
            let message = next_message(&mut rx).await;
            assert_eq!(message.payload, json!({ "n": i }));
            assert_eq!(message.sequence, i + 1);
            assert_eq!(&message.publisher, cluster.nodes()[0].local_id());
        }

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_retained_log_is_bounded() {
        let mut config = grid_config();
        config.topics.insert(
            "audit".to_string(),
            TopicConfig {
                global_ordering_enabled: true,
                retention: 3,
                ..TopicConfig::default()
            },
        );
        let cluster = started(1, config).await;
        let topic = cluster.first().unwrap().topic("audit");

        for i in 0..5 {
            topic.publish(json!(i)).await.unwrap();
        }

        let retained = topic.retained(0).await.unwrap();
        let sequences: Vec<u64> = retained.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert_eq!(topic.retained(4).await.unwrap().len(), 1);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_listener_stops_receiving() {
        let cluster = started(1, grid_config()).await;
        let topic = cluster.first().unwrap().topic("events");
        let received = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        let id = topic.add_message_listener(move |_message| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..3 {
            topic.publish(json!(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.load(Ordering::SeqCst), 3);

        assert!(topic.remove_message_listener(&id));
        assert!(!topic.remove_message_listener(&id));
        topic.publish(json!("late")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.load(Ordering::SeqCst), 3);

        cluster.shutdown().await;
    }
}
