//! Background expiry and size-bounded eviction of maps.
//!
//! Each map whose config has a TTL or an eviction policy gets a sweep task on the
//! first use of its name. A sweep works only on partitions this node owns, and its
//! removals go through the owner path as `MapEvict` ops so backups follow.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::store::PartitionStore;
use super::types::{PartitionOp, now_ms};
use crate::config::{ConfigRegistry, EvictionPolicy, MapConfig, MaxSizePolicy};
use crate::error::GridResult;
use crate::partition::PartitionId;

#[derive(Debug, Clone)]
struct Candidate {
    partition: PartitionId,
    key: String,
    version: u64,
    last_access: u64,
    hits: u64,
}

/// Orders candidates so the first ones are evicted first.
fn rank(candidates: &mut [Candidate], policy: EvictionPolicy) {
    match policy {
        EvictionPolicy::Lru => candidates.sort_by_key(|c| (c.last_access, c.version)),
        EvictionPolicy::Lfu => candidates.sort_by_key(|c| (c.hits, c.last_access, c.version)),
        EvictionPolicy::Random => candidates.shuffle(&mut rand::thread_rng()),
        EvictionPolicy::None => {}
    }
}

/// Picks the entries that must go for `candidates` to fit in `max_size`.
fn select_victims(
    mut candidates: Vec<Candidate>,
    max_size: usize,
    policy: EvictionPolicy,
) -> Vec<Candidate> {
    if candidates.len() <= max_size {
        return Vec::new();
    }
    let excess = candidates.len() - max_size;
    rank(&mut candidates, policy);
    candidates.truncate(excess);
    candidates
}

async fn live_candidates(store: &PartitionStore, partition: PartitionId, map: &str) -> Vec<Candidate> {
    let now = now_ms();
    store
        .inspect(partition, |slot| match slot.container.map(map) {
            Ok(Some(records)) => records
                .entries
                .values()
                .filter(|e| !e.is_expired(now))
                .map(|e| Candidate {
                    partition,
                    key: e.key.clone(),
                    version: e.version,
                    last_access: e.last_access,
                    hits: e.hits,
                })
                .collect(),
            _ => Vec::new(),
        })
        .await
        .unwrap_or_default()
}

/// Removes the given entries unless they changed since they were picked.
async fn evict(
    store: &PartitionStore,
    partition: PartitionId,
    map: &str,
    config: &MapConfig,
    victims: Vec<Candidate>,
) -> GridResult<usize> {
    store
        .mutate(partition, config.backup_count, |container, _, _| {
            let keys: Vec<String> = match container.map(map)? {
                Some(records) => victims
                    .iter()
                    .filter(|v| records.get(&v.key).is_some_and(|e| e.version == v.version))
                    .map(|v| v.key.clone())
                    .collect(),
                None => Vec::new(),
            };
            let count = keys.len();
            let ops = if keys.is_empty() {
                Vec::new()
            } else {
                vec![PartitionOp::MapEvict {
                    map: map.to_string(),
                    keys,
                }]
            };
            Ok((count, ops))
        })
        .await
}

async fn expire(store: &PartitionStore, partition: PartitionId, map: &str, config: &MapConfig) -> GridResult<usize> {
    store
        .mutate(partition, config.backup_count, |container, now, _| {
            let keys = match container.map(map)? {
                Some(records) => records.expired_keys(now),
                None => Vec::new(),
            };
            let count = keys.len();
            let ops = if keys.is_empty() {
                Vec::new()
            } else {
                vec![PartitionOp::MapEvict {
                    map: map.to_string(),
                    keys,
                }]
            };
            Ok((count, ops))
        })
        .await
}

/// One pass over the owned partitions of `map`: drops expired entries, then
/// evicts down to `max_size`. Returns the number of entries removed.
pub async fn sweep_map(store: &PartitionStore, map: &str, config: &MapConfig) -> GridResult<usize> {
    let owned = store.owned_partitions();
    let mut removed = 0;

    for partition in &owned {
        removed += expire(store, *partition, map, config).await?;
    }

    if !config.is_size_bounded() {
        return Ok(removed);
    }

    match config.max_size_policy {
        MaxSizePolicy::PerPartition => {
            for partition in &owned {
                let candidates = live_candidates(store, *partition, map).await;
                let victims = select_victims(candidates, config.max_size, config.eviction_policy);
                if !victims.is_empty() {
                    removed += evict(store, *partition, map, config, victims).await?;
                }
            }
        }
        MaxSizePolicy::PerNode => {
            let mut candidates = Vec::new();
            for partition in &owned {
                candidates.extend(live_candidates(store, *partition, map).await);
            }
            let victims = select_victims(candidates, config.max_size, config.eviction_policy);
            let mut by_partition: BTreeMap<PartitionId, Vec<Candidate>> = BTreeMap::new();
            for victim in victims {
                by_partition.entry(victim.partition).or_default().push(victim);
            }
            for (partition, victims) in by_partition {
                removed += evict(store, partition, map, config, victims).await?;
            }
        }
    }

    if removed > 0 {
        tracing::debug!("Sweep of map '{}' removed {} entries", map, removed);
    }
    Ok(removed)
}

/// Owns one sweep task per swept map.
pub struct EvictionManager {
    store: Arc<PartitionStore>,
    configs: Arc<ConfigRegistry>,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl EvictionManager {
    pub fn new(store: Arc<PartitionStore>, configs: Arc<ConfigRegistry>) -> Arc<Self> {
        Arc::new(Self {
            store,
            configs,
            tasks: DashMap::new(),
        })
    }

    /// Resolves the map's config and starts its sweep task if it needs one.
    pub fn track(&self, map: &str) -> MapConfig {
        let (config, _) = self.configs.map_resolved(map);
        if config.needs_sweep() && !self.tasks.contains_key(map) {
            self.tasks
                .entry(map.to_string())
                .or_insert_with(|| self.spawn_sweeper(map, config.clone()));
        }
        config
    }

    fn spawn_sweeper(&self, map: &str, config: MapConfig) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.configs.grid().sweep_interval();
        let map = map.to_string();
        tracing::info!(
            "Sweeping map '{}' every {:?} (ttl {}s, {:?} max {})",
            map,
            interval,
            config.ttl_seconds,
            config.eviction_policy,
            config.max_size
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = sweep_map(&store, &map, &config).await {
                    tracing::debug!("Sweep of map '{}' interrupted: {}", map, e);
                }
            }
        })
    }

    /// Runs one sweep of `map` immediately.
    pub async fn sweep_now(&self, map: &str) -> GridResult<usize> {
        let config = self.track(map);
        sweep_map(&self.store, map, &config).await
    }

    pub fn tracked_maps(&self) -> Vec<String> {
        let mut maps: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        maps.sort();
        maps
    }

    pub fn shutdown(&self) {
        for task in self.tasks.iter() {
            task.value().abort();
        }
        self.tasks.clear();
    }
}
