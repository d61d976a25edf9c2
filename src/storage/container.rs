use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use super::types::{Entry, OperationResult, PartitionOp};
use crate::error::{GridError, GridResult};
use crate::primitives::queue::QueueLog;
use crate::primitives::topic::TopicLog;

/// Entries of one map inside one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordStore {
    pub entries: HashMap<String, Entry>,
}

impl RecordStore {
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// The entry unless it expired.
    pub fn get_live(&self, key: &str, now_ms: u64) -> Option<&Entry> {
        self.entries.get(key).filter(|e| !e.is_expired(now_ms))
    }

    pub fn touch(&mut self, key: &str, tick: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access = tick;
            entry.hits += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live_len(&self, now_ms: u64) -> usize {
        self.entries.values().filter(|e| !e.is_expired(now_ms)).count()
    }

    pub fn expired_keys(&self, now_ms: u64) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now_ms))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn put(&mut self, key: &str, entry: Entry) {
        match self.entries.get(key) {
            Some(existing) if existing.version >= entry.version => {}
            Some(existing) => {
                let hits = existing.hits;
                self.entries.insert(key.to_string(), Entry { hits, ..entry });
            }
            None => {
                self.entries.insert(key.to_string(), entry);
            }
        }
    }

    fn remove_older_than(&mut self, key: &str, seq: u64) {
        if self.entries.get(key).is_some_and(|e| e.version < seq) {
            self.entries.remove(key);
        }
    }
}

/// Every named structure stored in a partition is one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicatedPrimitive {
    Map(RecordStore),
    Queue(QueueLog),
    Topic(TopicLog),
}

impl ReplicatedPrimitive {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicatedPrimitive::Map(_) => "map",
            ReplicatedPrimitive::Queue(_) => "queue",
            ReplicatedPrimitive::Topic(_) => "topic",
        }
    }
}

fn wrong(name: &str, existing: &ReplicatedPrimitive, requested: &str) -> GridError {
    GridError::WrongPrimitive {
        name: name.to_string(),
        existing: existing.kind().to_string(),
        requested: requested.to_string(),
    }
}

/// Requests remembered per partition for deduplication.
pub const REQUEST_LOG_CAPACITY: usize = 1024;

/// Results of the latest client requests that changed the partition, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestLog {
    order: VecDeque<String>,
    results: HashMap<String, OperationResult>,
}

impl RequestLog {
    pub fn get(&self, request_id: &str) -> Option<&OperationResult> {
        self.results.get(request_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn record(&mut self, request_id: &str, result: &OperationResult) {
        if self
            .results
            .insert(request_id.to_string(), result.clone())
            .is_some()
        {
            return;
        }
        self.order.push_back(request_id.to_string());
        while self.order.len() > REQUEST_LOG_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }
}

/// The data of one partition: named maps, queues and topics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionContainer {
    pub primitives: BTreeMap<String, ReplicatedPrimitive>,
    #[serde(default)]
    pub requests: RequestLog,
}

impl PartitionContainer {
    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn map(&self, name: &str) -> GridResult<Option<&RecordStore>> {
        match self.primitives.get(name) {
            None => Ok(None),
            Some(ReplicatedPrimitive::Map(store)) => Ok(Some(store)),
            Some(other) => Err(wrong(name, other, "map")),
        }
    }

    pub fn map_mut(&mut self, name: &str) -> GridResult<Option<&mut RecordStore>> {
        match self.primitives.get_mut(name) {
            None => Ok(None),
            Some(ReplicatedPrimitive::Map(store)) => Ok(Some(store)),
            Some(other) => Err(wrong(name, other, "map")),
        }
    }

    pub fn queue(&self, name: &str) -> GridResult<Option<&QueueLog>> {
        match self.primitives.get(name) {
            None => Ok(None),
            Some(ReplicatedPrimitive::Queue(queue)) => Ok(Some(queue)),
            Some(other) => Err(wrong(name, other, "queue")),
        }
    }

    pub fn topic(&self, name: &str) -> GridResult<Option<&TopicLog>> {
        match self.primitives.get(name) {
            None => Ok(None),
            Some(ReplicatedPrimitive::Topic(topic)) => Ok(Some(topic)),
            Some(other) => Err(wrong(name, other, "topic")),
        }
    }

    fn map_entry(&mut self, name: &str) -> GridResult<&mut RecordStore> {
        let primitive = self
            .primitives
            .entry(name.to_string())
            .or_insert_with(|| ReplicatedPrimitive::Map(RecordStore::default()));
        match primitive {
            ReplicatedPrimitive::Map(store) => Ok(store),
            other => Err(wrong(name, other, "map")),
        }
    }

    fn queue_entry(&mut self, name: &str) -> GridResult<&mut QueueLog> {
        let primitive = self
            .primitives
            .entry(name.to_string())
            .or_insert_with(|| ReplicatedPrimitive::Queue(QueueLog::default()));
        match primitive {
            ReplicatedPrimitive::Queue(queue) => Ok(queue),
            other => Err(wrong(name, other, "queue")),
        }
    }

    fn topic_entry(&mut self, name: &str) -> GridResult<&mut TopicLog> {
        let primitive = self
            .primitives
            .entry(name.to_string())
            .or_insert_with(|| ReplicatedPrimitive::Topic(TopicLog::default()));
        match primitive {
            ReplicatedPrimitive::Topic(topic) => Ok(topic),
            other => Err(wrong(name, other, "topic")),
        }
    }

    /// Applies an op produced at sequence `seq`. Owners, backups and WAL replay all
    /// go through here; a record older than the state it touches is a no-op.
    pub fn apply(&mut self, op: &PartitionOp, seq: u64, tick: u64) -> GridResult<()> {
        match op {
            PartitionOp::MapPut {
                map,
                key,
                value,
                ttl_ms,
                created_at_ms,
            } => {
                self.map_entry(map)?.put(
                    key,
                    Entry {
                        key: key.clone(),
                        value: value.clone(),
                        version: seq,
                        created_at_ms: *created_at_ms,
                        ttl_ms: *ttl_ms,
                        last_access: tick,
                        hits: 0,
                    },
                );
            }
            PartitionOp::MapRemove { map, key } => {
                if let Some(store) = self.map_mut(map)? {
                    store.remove_older_than(key, seq);
                }
            }
            PartitionOp::MapEvict { map, keys } => {
                if let Some(store) = self.map_mut(map)? {
                    for key in keys {
                        store.remove_older_than(key, seq);
                    }
                }
            }
            PartitionOp::QueueOffer { queue, item } => {
                self.queue_entry(queue)?.apply_offer(seq, item.clone());
            }
            PartitionOp::QueuePoll { queue, item_seq } => {
                self.queue_entry(queue)?.apply_poll(*item_seq);
            }
            PartitionOp::TopicPublish {
                topic,
                message,
                retention,
            } => {
                self.topic_entry(topic)?.apply_publish(message.clone(), *retention);
            }
            PartitionOp::RecordRequest { request_id, result } => {
                self.requests.record(request_id, result);
            }
        }
        Ok(())
    }
}
