//! Grid Configuration
//!
//! `GridConfig` is the single configuration object of a node. It is loaded from a
//! JSON file (every field optional, defaults below) and validated before the node
//! joins. Named map/queue/topic/executor configs are resolved by exact name, falling
//! back to the `default_*` entry; the resolved config of a name is frozen on first use.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;

pub const DEFAULT_PARTITION_COUNT: u32 = 271;
pub const MAX_BACKUP_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionPolicy {
    #[default]
    None,
    Lru,
    Lfu,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaxSizePolicy {
    #[default]
    PerNode,
    PerPartition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub backup_count: usize,
    pub async_backup_count: usize,
    /// Map-wide TTL in seconds; 0 disables expiry.
    pub ttl_seconds: u64,
    pub eviction_policy: EvictionPolicy,
    pub max_size_policy: MaxSizePolicy,
    /// 0 means unbounded.
    pub max_size: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            backup_count: 1,
            async_backup_count: 0,
            ttl_seconds: 0,
            eviction_policy: EvictionPolicy::None,
            max_size_policy: MaxSizePolicy::PerNode,
            max_size: 0,
        }
    }
}

impl MapConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }

    pub fn is_size_bounded(&self) -> bool {
        self.max_size > 0 && self.eviction_policy != EvictionPolicy::None
    }

    pub fn needs_sweep(&self) -> bool {
        self.ttl_seconds > 0 || self.is_size_bounded()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backup_count: usize,
    pub async_backup_count: usize,
    /// 0 means unbounded.
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backup_count: 1,
            async_backup_count: 0,
            max_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub global_ordering_enabled: bool,
    pub backup_count: usize,
    pub async_backup_count: usize,
    /// Messages retained in the partition log of a globally ordered topic.
    pub retention: usize,
    /// Per-subscriber buffer; a subscriber lagging further behind loses messages.
    pub subscriber_buffer: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            global_ordering_enabled: false,
            backup_count: 0,
            async_backup_count: 1,
            retention: 1024,
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
    /// Lifetime of a task record in the results map; 0 keeps records forever.
    pub result_ttl_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 1000,
            result_ttl_seconds: 3_600,
        }
    }
}

impl ExecutorConfig {
    /// `Duration::ZERO` when records never expire.
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Upper bound on the wait for synchronous backup acknowledgments.
    pub timeout_ms: u64,
    /// Attempts per backup before an ack miss escalates.
    pub retries: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub timeout_ms: u64,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub parallelism: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_attempts: 6,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
            parallelism: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpConfig {
    /// Designated members of the coordination group. Empty means the group is the
    /// single local node.
    pub members: Vec<NodeId>,
    pub session_lease_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub lock_retry_interval_ms: u64,
    /// Applied log entries kept before they are folded into a snapshot.
    pub snapshot_threshold: u64,
}

impl Default for CpConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            session_lease_ms: 10_000,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            lock_retry_interval_ms: 25,
            snapshot_threshold: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub cluster_name: String,
    pub partition_count: u32,
    pub default_map: MapConfig,
    pub maps: HashMap<String, MapConfig>,
    pub default_queue: QueueConfig,
    pub queues: HashMap<String, QueueConfig>,
    pub default_topic: TopicConfig,
    pub topics: HashMap<String, TopicConfig>,
    pub default_executor: ExecutorConfig,
    pub executors: HashMap<String, ExecutorConfig>,
    pub replication: ReplicationConfig,
    pub migration: MigrationConfig,
    pub eviction_sweep_interval_ms: u64,
    pub cp: CpConfig,
    /// Directory for per-partition WAL segments; `None` keeps the node purely in-memory.
    pub wal_dir: Option<PathBuf>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cluster_name: "memgrid".to_string(),
            partition_count: DEFAULT_PARTITION_COUNT,
            default_map: MapConfig::default(),
            maps: HashMap::new(),
            default_queue: QueueConfig::default(),
            queues: HashMap::new(),
            default_topic: TopicConfig::default(),
            topics: HashMap::new(),
            default_executor: ExecutorConfig::default(),
            executors: HashMap::new(),
            replication: ReplicationConfig::default(),
            migration: MigrationConfig::default(),
            eviction_sweep_interval_ms: 1_000,
            cp: CpConfig::default(),
            wal_dir: None,
        }
    }
}

impl GridConfig {
    pub fn load(path: &Path) -> GridResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GridError::Config(format!("{}: {}", path.display(), e)))?;
        let config: GridConfig = serde_json::from_str(&raw)
            .map_err(|e| GridError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Single-node friendly settings: no backups anywhere.
    pub fn development() -> Self {
        let mut config = Self {
            cluster_name: "dev".to_string(),
            ..Self::default()
        };
        config.default_map.backup_count = 0;
        config.default_map.async_backup_count = 0;
        config.default_queue.backup_count = 0;
        config.default_queue.async_backup_count = 0;
        config.default_topic.async_backup_count = 0;
        config
    }

    /// The named structures used by the demo cluster.
    pub fn demo() -> Self {
        let mut config = Self {
            cluster_name: "memgrid-demo-cluster".to_string(),
            ..Self::default()
        };
        config.maps.insert(
            "users".to_string(),
            MapConfig {
                backup_count: 1,
                async_backup_count: 0,
                ttl_seconds: 3600,
                eviction_policy: EvictionPolicy::Lru,
                max_size_policy: MaxSizePolicy::PerNode,
                max_size: 1000,
            },
        );
        config.maps.insert(
            "cache".to_string(),
            MapConfig {
                backup_count: 0,
                ttl_seconds: 300,
                ..MapConfig::default()
            },
        );
        config.queues.insert(
            "demo-queue".to_string(),
            QueueConfig {
                backup_count: 1,
                async_backup_count: 0,
                max_size: 1000,
            },
        );
        config.topics.insert(
            "demo-topic".to_string(),
            TopicConfig {
                global_ordering_enabled: true,
                ..TopicConfig::default()
            },
        );
        config.executors.insert(
            "demo-executor".to_string(),
            ExecutorConfig {
                pool_size: 2,
                queue_capacity: 100,
                ..ExecutorConfig::default()
            },
        );
        config
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.partition_count == 0 {
            return Err(GridError::Config("partition_count must be > 0".to_string()));
        }
        if self.cluster_name.is_empty() {
            return Err(GridError::Config("cluster_name must not be empty".to_string()));
        }
        let mut replica_counts: Vec<(&str, usize)> = vec![(
            "default_map",
            self.default_map.backup_count + self.default_map.async_backup_count,
        )];
        replica_counts.extend(
            self.maps
                .iter()
                .map(|(name, c)| (name.as_str(), c.backup_count + c.async_backup_count)),
        );
        replica_counts.extend(
            self.queues
                .iter()
                .map(|(name, c)| (name.as_str(), c.backup_count + c.async_backup_count)),
        );
        replica_counts.extend(
            self.topics
                .iter()
                .map(|(name, c)| (name.as_str(), c.backup_count + c.async_backup_count)),
        );
        for (name, count) in replica_counts {
            if count > MAX_BACKUP_COUNT {
                return Err(GridError::Config(format!(
                    "'{}' asks for {} backups, at most {} are supported",
                    name, count, MAX_BACKUP_COUNT
                )));
            }
        }
        if self.cp.election_timeout_min_ms >= self.cp.election_timeout_max_ms {
            return Err(GridError::Config(
                "cp.election_timeout_min_ms must be below cp.election_timeout_max_ms".to_string(),
            ));
        }
        if self.cp.heartbeat_interval_ms >= self.cp.election_timeout_min_ms {
            return Err(GridError::Config(
                "cp.heartbeat_interval_ms must be below the election timeout".to_string(),
            ));
        }
        if !self.cp.members.is_empty() && self.cp.members.len() % 2 == 0 {
            tracing::warn!(
                "CP group has an even member count ({}), one member adds no fault tolerance",
                self.cp.members.len()
            );
        }
        for (name, executor) in &self.executors {
            if executor.pool_size == 0 {
                return Err(GridError::Config(format!(
                    "executor '{}' needs a pool_size > 0",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn map_config(&self, name: &str) -> MapConfig {
        self.maps
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_map.clone())
    }

    /// An executor's task queue defaults to the executor's capacity.
    pub fn queue_config(&self, name: &str) -> QueueConfig {
        if let Some(config) = self.queues.get(name) {
            return config.clone();
        }
        match self.executors.get(name) {
            Some(executor) => QueueConfig {
                max_size: executor.queue_capacity,
                ..self.default_queue.clone()
            },
            None => self.default_queue.clone(),
        }
    }

    pub fn topic_config(&self, name: &str) -> TopicConfig {
        self.topics
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_topic.clone())
    }

    pub fn executor_config(&self, name: &str) -> ExecutorConfig {
        self.executors
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_executor.clone())
    }

    /// Length of every partition's backup list: the largest replica count any
    /// structure can ask for.
    pub fn table_backup_count(&self) -> usize {
        let maps = std::iter::once(&self.default_map)
            .chain(self.maps.values())
            .map(|c| c.backup_count + c.async_backup_count);
        let queues = std::iter::once(&self.default_queue)
            .chain(self.queues.values())
            .map(|c| c.backup_count + c.async_backup_count);
        let topics = std::iter::once(&self.default_topic)
            .chain(self.topics.values())
            .map(|c| c.backup_count + c.async_backup_count);
        maps.chain(queues)
            .chain(topics)
            .max()
            .unwrap_or(0)
            .min(MAX_BACKUP_COUNT)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_sweep_interval_ms)
    }
}

/// Per-name configs resolved on first use and frozen afterwards.
pub struct ConfigRegistry {
    grid: GridConfig,
    maps: DashMap<String, MapConfig>,
    queues: DashMap<String, QueueConfig>,
    topics: DashMap<String, TopicConfig>,
    executors: DashMap<String, ExecutorConfig>,
}

impl ConfigRegistry {
    pub fn new(grid: GridConfig) -> Self {
        Self {
            grid,
            maps: DashMap::new(),
            queues: DashMap::new(),
            topics: DashMap::new(),
            executors: DashMap::new(),
        }
    }

    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    pub fn map(&self, name: &str) -> MapConfig {
        self.map_resolved(name).0
    }

    /// The map's config, and whether this call was the one that resolved it.
    pub fn map_resolved(&self, name: &str) -> (MapConfig, bool) {
        if let Some(config) = self.maps.get(name) {
            return (config.clone(), false);
        }
        let mut first = false;
        let config = self
            .maps
            .entry(name.to_string())
            .or_insert_with(|| {
                first = true;
                self.grid.map_config(name)
            })
            .clone();
        (config, first)
    }

    pub fn queue(&self, name: &str) -> QueueConfig {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| self.grid.queue_config(name))
            .clone()
    }

    pub fn topic(&self, name: &str) -> TopicConfig {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| self.grid.topic_config(name))
            .clone()
    }

    pub fn executor(&self, name: &str) -> ExecutorConfig {
        self.executors
            .entry(name.to_string())
            .or_insert_with(|| self.grid.executor_config(name))
            .clone()
    }

    /// Pins the config of a queue that has not been used yet. Returns the config in
    /// force, which is the earlier one if the queue was already resolved.
    pub fn pin_queue(&self, name: &str, config: QueueConfig) -> QueueConfig {
        self.queues
            .entry(name.to_string())
            .or_insert(config)
            .clone()
    }

    pub fn resolved_maps(&self) -> Vec<(String, MapConfig)> {
        self.maps
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
