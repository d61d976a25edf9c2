//! Publish/subscribe topics.
//!
//! Every node runs a [`TopicHub`] holding one broadcast channel per topic for its
//! local subscribers. A published message is fanned out to the hub of every live
//! node by an ordered per-topic task, so each node sees one publisher's messages in
//! sequence order.
//!
//! With `global_ordering_enabled` the publish is routed to the owner of the topic's
//! partition, which assigns the sequence, keeps the message in a bounded retained log
//! and fans it out. Otherwise each publishing node sequences its own messages.
//! Delivery is at-most-once: a subscriber that lags past its buffer loses messages.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::cluster::gateway::GridClient;
use crate::config::ConfigRegistry;
use crate::error::GridResult;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::storage::container::PartitionContainer;
use crate::storage::types::{Operation, OperationResult, PartitionOp, TopicOperation, now_ms};
use crate::transport::ClusterTransport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Value,
    pub published_at_ms: u64,
    pub publisher: NodeId,
    pub sequence: u64,
}

/// Retained messages of a globally ordered topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicLog {
    pub messages: VecDeque<TopicMessage>,
    pub last_sequence: u64,
}

impl TopicLog {
    pub(crate) fn apply_publish(&mut self, message: TopicMessage, retention: usize) {
        if message.sequence <= self.last_sequence {
            return;
        }
        self.last_sequence = message.sequence;
        self.messages.push_back(message);
        while self.messages.len() > retention.max(1) {
            self.messages.pop_front();
        }
    }
}

/// Runs a topic operation at the partition owner.
pub(crate) fn execute(
    container: &PartitionContainer,
    topic: &str,
    op: &TopicOperation,
    retention: usize,
) -> GridResult<(OperationResult, Vec<PartitionOp>)> {
    let log = container.topic(topic)?;
    let outcome = match op {
        TopicOperation::Publish {
            payload,
            publisher,
            published_at_ms,
        } => {
            let sequence = log.map(|l| l.last_sequence).unwrap_or(0) + 1;
            (
                OperationResult::Published { sequence },
                vec![PartitionOp::TopicPublish {
                    topic: topic.to_string(),
                    message: TopicMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                        published_at_ms: *published_at_ms,
                        publisher: publisher.clone(),
                        sequence,
                    },
                    retention,
                }],
            )
        }
        TopicOperation::Retained { after } => (
            OperationResult::Messages(
                log.map(|l| {
                    l.messages
                        .iter()
                        .filter(|m| m.sequence > *after)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            ),
            Vec::new(),
        ),
    };
    Ok(outcome)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub String);

/// Node-local side of every topic: subscriber channels and ordered fan-out.
pub struct TopicHub {
    local_id: NodeId,
    membership: Arc<MembershipService>,
    transport: Arc<dyn ClusterTransport>,
    configs: Arc<ConfigRegistry>,
    channels: DashMap<String, broadcast::Sender<TopicMessage>>,
    fanouts: DashMap<String, mpsc::UnboundedSender<TopicMessage>>,
    local_sequences: DashMap<String, u64>,
    listeners: DashMap<ListenerId, JoinHandle<()>>,
}

impl TopicHub {
    pub fn new(
        membership: Arc<MembershipService>,
        transport: Arc<dyn ClusterTransport>,
        configs: Arc<ConfigRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: membership.local_node.id.clone(),
            membership,
            transport,
            configs,
            channels: DashMap::new(),
            fanouts: DashMap::new(),
            local_sequences: DashMap::new(),
            listeners: DashMap::new(),
        })
    }

    fn channel(&self, topic: &str) -> broadcast::Sender<TopicMessage> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| {
                let buffer = self.configs.topic(topic).subscriber_buffer.max(1);
                broadcast::channel(buffer).0
            })
            .clone()
    }

    /// Hands a message to local subscribers.
    pub fn deliver(&self, message: TopicMessage) {
        let sender = self.channel(&message.topic);
        // No subscribers is not an error: the message is simply not seen.
        let _ = sender.send(message);
    }

    /// Queues a message for ordered delivery to every live node, this one included.
    /// Must be called in sequence order for a given topic.
    pub fn fan_out(&self, message: TopicMessage) {
        let topic = message.topic.clone();
        let sender = self
            .fanouts
            .entry(topic.clone())
            .or_insert_with(|| self.spawn_fanout(&topic))
            .clone();
        if sender.send(message).is_err() {
            tracing::warn!("Fan-out task for topic '{}' is gone", topic);
        }
    }

    fn spawn_fanout(&self, topic: &str) -> mpsc::UnboundedSender<TopicMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TopicMessage>();
        let local_channel = self.channel(topic);
        let local_id = self.local_id.clone();
        let membership = self.membership.clone();
        let transport = self.transport.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let targets: Vec<NodeId> = membership
                    .live_node_ids()
                    .into_iter()
                    .filter(|n| n != &local_id)
                    .collect();
                let _ = local_channel.send(message.clone());
                let sends = targets.iter().map(|target| {
                    let message = message.clone();
                    let transport = transport.clone();
                    async move { (target, transport.deliver_topic(target, message).await) }
                });
                for (target, result) in futures::future::join_all(sends).await {
                    if let Err(e) = result {
                        tracing::debug!(
                            "Dropped message {} of '{}' for {}: {}",
                            message.sequence,
                            topic,
                            target,
                            e
                        );
                    }
                }
            }
            tracing::debug!("Fan-out for topic '{}' stopped", topic);
        });
        tx
    }

    /// Publishes without a partition round trip: this node sequences its own messages.
    pub fn publish_local(&self, topic: &str, payload: Value) -> TopicMessage {
        let mut next = self.local_sequences.entry(topic.to_string()).or_insert(0);
        *next += 1;
        let message = TopicMessage {
            topic: topic.to_string(),
            payload,
            published_at_ms: now_ms(),
            publisher: self.local_id.clone(),
            sequence: *next,
        };
        // Enqueued while the counter is held so sequences leave in order.
        self.fan_out(message.clone());
        message
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicMessage> {
        self.channel(topic).subscribe()
    }

    /// Calls `listener` for every message of `topic` delivered to this node from now on.
    pub fn add_message_listener<F>(&self, topic: &str, listener: F) -> ListenerId
    where
        F: Fn(TopicMessage) + Send + Sync + 'static,
    {
        let id = ListenerId(uuid::Uuid::new_v4().to_string());
        let mut rx = self.subscribe(topic);
        let topic_name = topic.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => listener(message),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Listener on '{}' missed {} messages", topic_name, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(id.clone(), handle);
        tracing::debug!("Added listener {:?} on topic '{}'", id, topic);
        id
    }

    pub fn remove_message_listener(&self, id: &ListenerId) -> bool {
        match self.listeners.remove(id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        for entry in self.listeners.iter() {
            entry.value().abort();
        }
        self.listeners.clear();
        self.fanouts.clear();
    }
}

/// Client handle for a named topic.
#[derive(Clone)]
pub struct DistributedTopic {
    name: String,
    global_ordering: bool,
    client: GridClient,
    hub: Arc<TopicHub>,
}

impl DistributedTopic {
    pub fn new(name: &str, global_ordering: bool, client: GridClient, hub: Arc<TopicHub>) -> Self {
        Self {
            name: name.to_string(),
            global_ordering,
            client,
            hub,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `payload` and returns the sequence number it was given.
    pub async fn publish(&self, payload: Value) -> GridResult<u64> {
        if !self.global_ordering {
            return Ok(self.hub.publish_local(&self.name, payload).sequence);
        }
        self.client
            .invoke(Operation::Topic {
                topic: self.name.clone(),
                op: TopicOperation::Publish {
                    payload,
                    publisher: self.client.local_id().clone(),
                    published_at_ms: now_ms(),
                },
            })
            .await?
            .into_sequence()
    }

    /// Messages still retained by the partition owner with a sequence above `after`.
    /// Only globally ordered topics retain messages.
    pub async fn retained(&self, after: u64) -> GridResult<Vec<TopicMessage>> {
        if !self.global_ordering {
            return Ok(Vec::new());
        }
        self.client
            .invoke(Operation::Topic {
                topic: self.name.clone(),
                op: TopicOperation::Retained { after },
            })
            .await?
            .into_messages()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.hub.subscribe(&self.name)
    }

    pub fn add_message_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(TopicMessage) + Send + Sync + 'static,
    {
        self.hub.add_message_listener(&self.name, listener)
    }

    pub fn remove_message_listener(&self, id: &ListenerId) -> bool {
        self.hub.remove_message_listener(id)
    }
}
