//! Distributed map: owner-side command logic, entry processors and the client handle.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::container::PartitionContainer;
use super::types::{EntryView, MapOperation, Operation, OperationResult, PartitionOp};
use crate::cluster::gateway::GridClient;
use crate::error::{GridError, GridResult};

/// What an entry processor does to the entry it ran on.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryUpdate {
    Keep,
    Set(Value),
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutcome {
    pub result: Value,
    pub update: EntryUpdate,
}

impl ProcessorOutcome {
    pub fn keep(result: Value) -> Self {
        Self {
            result,
            update: EntryUpdate::Keep,
        }
    }

    pub fn set(result: Value, value: Value) -> Self {
        Self {
            result,
            update: EntryUpdate::Set(value),
        }
    }
}

/// Type alias for a thread-safe entry processor.
/// It receives the key, the current value (if any) and the caller's argument.
pub type EntryProcessorFn =
    Arc<dyn Fn(&str, Option<&Value>, &Value) -> ProcessorOutcome + Send + Sync>;

/// Processors are registered by name on every node; only the name travels.
pub struct EntryProcessorRegistry {
    processors: DashMap<String, EntryProcessorFn>,
}

impl EntryProcessorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F>(&self, name: &str, processor: F)
    where
        F: Fn(&str, Option<&Value>, &Value) -> ProcessorOutcome + Send + Sync + 'static,
    {
        self.processors
            .insert(name.to_string(), Arc::new(processor));
        tracing::info!("Registered entry processor: {}", name);
    }

    pub fn get(&self, name: &str) -> GridResult<EntryProcessorFn> {
        self.processors
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| GridError::UnknownProcessor(name.to_string()))
    }

    pub fn has_processor(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }
}

impl Default for EntryProcessorRegistry {
    fn default() -> Self {
        Self {
            processors: DashMap::new(),
        }
    }
}

/// Owner-side inputs of a map command.
pub(crate) struct MapContext<'a> {
    pub now_ms: u64,
    pub tick: u64,
    pub default_ttl_ms: Option<u64>,
    pub processors: &'a EntryProcessorRegistry,
}

impl MapContext<'_> {
    fn ttl(&self, requested: Option<u64>) -> Option<u64> {
        match requested {
            Some(0) => None,
            Some(ttl) => Some(ttl),
            None => self.default_ttl_ms,
        }
    }
}

/// Whole milliseconds, rounded up so a sub-millisecond TTL still expires.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() as u64;
    if Duration::from_millis(millis) < ttl {
        millis + 1
    } else {
        millis
    }
}

fn put_op(map: &str, key: &str, value: Value, ttl_ms: Option<u64>, now_ms: u64) -> PartitionOp {
    PartitionOp::MapPut {
        map: map.to_string(),
        key: key.to_string(),
        value,
        ttl_ms,
        created_at_ms: now_ms,
    }
}

fn update_op(map: &str, key: &str, update: EntryUpdate, ttl_ms: Option<u64>, now_ms: u64) -> Option<PartitionOp> {
    match update {
        EntryUpdate::Keep => None,
        EntryUpdate::Set(value) => Some(put_op(map, key, value, ttl_ms, now_ms)),
        EntryUpdate::Remove => Some(PartitionOp::MapRemove {
            map: map.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Runs a map command at the partition owner: computes the caller's result and the
/// ops that make it happen. An expired entry reads as absent and its removal is
/// part of the ops.
pub(crate) fn execute(
    container: &mut PartitionContainer,
    map: &str,
    key: &str,
    op: &MapOperation,
    ctx: &MapContext<'_>,
) -> GridResult<(OperationResult, Vec<PartitionOp>)> {
    let mut ops = Vec::new();

    let current = match container.map_mut(map)? {
        Some(store) => {
            let expired = store.get(key).is_some_and(|e| e.is_expired(ctx.now_ms));
            if expired {
                tracing::debug!("Lazy expiry of '{}' in map '{}'", key, map);
                ops.push(PartitionOp::MapEvict {
                    map: map.to_string(),
                    keys: vec![key.to_string()],
                });
                None
            } else {
                if !matches!(op, MapOperation::ContainsKey) {
                    store.touch(key, ctx.tick);
                }
                store.get(key).cloned()
            }
        }
        None => None,
    };

    let result = match op {
        MapOperation::Get => OperationResult::Value(current.map(|e| e.value)),
        MapOperation::GetEntry => OperationResult::Entry(current.map(|e| e.view())),
        MapOperation::ContainsKey => OperationResult::Bool(current.is_some()),
        MapOperation::Put { value, ttl_ms } => {
            ops.push(put_op(map, key, value.clone(), ctx.ttl(*ttl_ms), ctx.now_ms));
            OperationResult::Value(current.map(|e| e.value))
        }
        MapOperation::PutIfAbsent { value, ttl_ms } => match current {
            Some(existing) => OperationResult::Value(Some(existing.value)),
            None => {
                ops.push(put_op(map, key, value.clone(), ctx.ttl(*ttl_ms), ctx.now_ms));
                OperationResult::Value(None)
            }
        },
        MapOperation::Remove => {
            if current.is_some() {
                ops.push(PartitionOp::MapRemove {
                    map: map.to_string(),
                    key: key.to_string(),
                });
            }
            OperationResult::Value(current.map(|e| e.value))
        }
        MapOperation::Replace { expected, value } => match current {
            Some(existing) if &existing.value == expected => {
                ops.push(put_op(map, key, value.clone(), existing.ttl_ms, ctx.now_ms));
                OperationResult::Bool(true)
            }
            _ => OperationResult::Bool(false),
        },
        MapOperation::ReplaceIfVersion { version, value } => match current {
            Some(existing) if existing.version == *version => {
                ops.push(put_op(map, key, value.clone(), existing.ttl_ms, ctx.now_ms));
                OperationResult::Bool(true)
            }
            _ => OperationResult::Bool(false),
        },
        MapOperation::ExecuteOnEntry {
            processor,
            argument,
        } => {
            let processor = ctx.processors.get(processor)?;
            let outcome = processor(key, current.as_ref().map(|e| &e.value), argument);
            let ttl = current
                .as_ref()
                .map(|e| e.ttl_ms)
                .unwrap_or(ctx.default_ttl_ms);
            if let Some(op) = update_op(map, key, outcome.update, ttl, ctx.now_ms) {
                ops.push(op);
            }
            OperationResult::Processed(outcome.result)
        }
    };
    Ok((result, ops))
}

/// Runs a processor over every live entry of `map` in one partition.
pub(crate) fn execute_on_all(
    container: &PartitionContainer,
    map: &str,
    processor: &str,
    argument: &Value,
    ctx: &MapContext<'_>,
) -> GridResult<(BTreeMap<String, Value>, Vec<PartitionOp>)> {
    let processor = ctx.processors.get(processor)?;
    let mut results = BTreeMap::new();
    let mut ops = Vec::new();
    let Some(store) = container.map(map)? else {
        return Ok((results, ops));
    };
    let mut keys: Vec<&String> = store.entries.keys().collect();
    keys.sort();
    for key in keys {
        let Some(entry) = store.get_live(key, ctx.now_ms) else {
            continue;
        };
        let outcome = processor(key, Some(&entry.value), argument);
        if let Some(op) = update_op(map, key, outcome.update, entry.ttl_ms, ctx.now_ms) {
            ops.push(op);
        }
        results.insert(key.clone(), outcome.result);
    }
    Ok((results, ops))
}

/// Client handle for a named map. Cheap to clone.
#[derive(Clone)]
pub struct DistributedMap {
    name: String,
    client: GridClient,
}

impl DistributedMap {
    pub fn new(name: &str, client: GridClient) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, key: &str, op: MapOperation) -> GridResult<OperationResult> {
        self.client
            .invoke(Operation::Map {
                map: self.name.clone(),
                key: key.to_string(),
                op,
            })
            .await
    }

    /// Stores `value` with the map's default TTL and returns the previous value.
    pub async fn put(&self, key: &str, value: Value) -> GridResult<Option<Value>> {
        self.call(key, MapOperation::Put { value, ttl_ms: None })
            .await?
            .into_value()
    }

    /// Stores `value` with its own TTL; `Duration::ZERO` means no expiry.
    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> GridResult<Option<Value>> {
        self.call(
            key,
            MapOperation::Put {
                value,
                ttl_ms: Some(ttl_millis(ttl)),
            },
        )
        .await?
        .into_value()
    }

    pub async fn get(&self, key: &str) -> GridResult<Option<Value>> {
        self.call(key, MapOperation::Get).await?.into_value()
    }

    pub async fn get_entry(&self, key: &str) -> GridResult<Option<EntryView>> {
        self.call(key, MapOperation::GetEntry).await?.into_entry()
    }

    pub async fn remove(&self, key: &str) -> GridResult<Option<Value>> {
        self.call(key, MapOperation::Remove).await?.into_value()
    }

    /// Returns the value already stored, or `None` if `value` was stored.
    pub async fn put_if_absent(&self, key: &str, value: Value) -> GridResult<Option<Value>> {
        self.call(key, MapOperation::PutIfAbsent { value, ttl_ms: None })
            .await?
            .into_value()
    }

    pub async fn replace(&self, key: &str, expected: Value, value: Value) -> GridResult<bool> {
        self.call(key, MapOperation::Replace { expected, value })
            .await?
            .into_bool()
    }

    pub async fn replace_if_version(
        &self,
        key: &str,
        version: u64,
        value: Value,
    ) -> GridResult<bool> {
        self.call(key, MapOperation::ReplaceIfVersion { version, value })
            .await?
            .into_bool()
    }

    pub async fn contains_key(&self, key: &str) -> GridResult<bool> {
        self.call(key, MapOperation::ContainsKey).await?.into_bool()
    }

    pub async fn execute_on_entry(
        &self,
        key: &str,
        processor: &str,
        argument: Value,
    ) -> GridResult<Value> {
        self.call(
            key,
            MapOperation::ExecuteOnEntry {
                processor: processor.to_string(),
                argument,
            },
        )
        .await?
        .into_processed()
    }

    /// Runs `processor` on every entry, on the nodes that own them.
    pub async fn execute_on_entries(
        &self,
        processor: &str,
        argument: Value,
    ) -> GridResult<BTreeMap<String, Value>> {
        let mut merged = BTreeMap::new();
        let op = Operation::ExecuteOnOwnedEntries {
            map: self.name.clone(),
            processor: processor.to_string(),
            argument,
        };
        for result in self.client.invoke_on_all(op).await? {
            merged.extend(result.into_processed_many()?);
        }
        Ok(merged)
    }

    /// Live entries, summed over the owners of every partition.
    pub async fn size(&self) -> GridResult<usize> {
        let op = Operation::OwnedMapSize {
            map: self.name.clone(),
        };
        let mut total = 0;
        for result in self.client.invoke_on_all(op).await? {
            total += result.into_size()?;
        }
        Ok(total)
    }
}
