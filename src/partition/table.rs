use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::membership::types::NodeId;

pub type PartitionId = u32;

/// Maps a key (or a queue/topic name) to its partition.
///
/// Pure function of the key bytes and the partition count, so every node agrees on
/// it without coordination and it never changes with membership. A key of the form
/// `name@partition_key` is placed by `partition_key` alone, which keeps related
/// entries in one partition.
pub fn partition_for(key: &str, partition_count: u32) -> PartitionId {
    crc32fast::hash(placement_key(key).as_bytes()) % partition_count.max(1)
}

/// The part of `key` that selects its partition.
pub fn placement_key(key: &str) -> &str {
    match key.split_once('@') {
        Some((_, partition_key)) if !partition_key.is_empty() => partition_key,
        _ => key,
    }
}

/// A key placed by an explicit partition key rather than by itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionAwareKey {
    pub key: String,
    pub partition_key: String,
}

impl PartitionAwareKey {
    pub fn new(key: impl Into<String>, partition_key: impl ToString) -> Self {
        Self {
            key: key.into(),
            partition_key: partition_key.to_string(),
        }
    }
}

impl std::fmt::Display for PartitionAwareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key, self.partition_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partition: PartitionId,
    pub owner: Option<NodeId>,
    /// Ordered: the first backup is the promotion candidate.
    pub backups: Vec<NodeId>,
    /// Nodes currently receiving a migration snapshot of this partition.
    #[serde(default)]
    pub incoming: Vec<NodeId>,
}

impl PartitionAssignment {
    pub fn empty(partition: PartitionId) -> Self {
        Self {
            partition,
            ..Self::default()
        }
    }

    /// Owner first, then backups.
    pub fn replicas(&self) -> impl Iterator<Item = &NodeId> {
        self.owner.iter().chain(self.backups.iter())
    }

    pub fn is_owner(&self, node: &NodeId) -> bool {
        self.owner.as_ref() == Some(node)
    }

    pub fn is_replica(&self, node: &NodeId) -> bool {
        self.replicas().any(|n| n == node)
    }

    /// Replica or migration destination: a node that must keep this partition's data.
    pub fn keeps_data(&self, node: &NodeId) -> bool {
        self.is_replica(node) || self.incoming.contains(node)
    }

    /// Same owner and backups, ignoring in-flight migrations.
    pub fn same_placement(&self, other: &PartitionAssignment) -> bool {
        self.owner == other.owner && self.backups == other.backups
    }
}

/// The cluster-wide partition table.
///
/// Only the master publishes tables; every node keeps the newest one it has seen and
/// rejects anything whose `version` is not newer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub version: u64,
    /// Version of the master's membership event this table was computed for.
    pub membership_version: u64,
    pub assignments: Vec<PartitionAssignment>,
}

impl PartitionTable {
    /// Version 0, every partition ownerless.
    pub fn new(partition_count: u32) -> Self {
        Self {
            version: 0,
            membership_version: 0,
            assignments: (0..partition_count).map(PartitionAssignment::empty).collect(),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.assignments.len() as u32
    }

    pub fn assignment(&self, partition: PartitionId) -> Option<&PartitionAssignment> {
        self.assignments.get(partition as usize)
    }

    pub fn owner_of(&self, partition: PartitionId) -> Option<&NodeId> {
        self.assignment(partition).and_then(|a| a.owner.as_ref())
    }

    pub fn owned_by(&self, node: &NodeId) -> Vec<PartitionId> {
        self.assignments
            .iter()
            .filter(|a| a.is_owner(node))
            .map(|a| a.partition)
            .collect()
    }

    pub fn backed_up_by(&self, node: &NodeId) -> Vec<PartitionId> {
        self.assignments
            .iter()
            .filter(|a| a.backups.contains(node))
            .map(|a| a.partition)
            .collect()
    }

    pub fn owner_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts = BTreeMap::new();
        for owner in self.assignments.iter().filter_map(|a| a.owner.as_ref()) {
            *counts.entry(owner.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Checks the placement invariants: owner not among backups, no duplicate replicas,
    /// at most `backup_count` backups, and an owner everywhere if `live` is non-empty.
    pub fn check_invariants(&self, live: &[NodeId], backup_count: usize) -> Result<(), String> {
        for a in &self.assignments {
            let mut seen = HashSet::new();
            for replica in a.replicas() {
                if !seen.insert(replica) {
                    return Err(format!("partition {} repeats {}", a.partition, replica));
                }
                if !live.contains(replica) {
                    return Err(format!("partition {} uses dead node {}", a.partition, replica));
                }
            }
            if a.backups.len() > backup_count {
                return Err(format!(
                    "partition {} has {} backups (max {})",
                    a.partition,
                    a.backups.len(),
                    backup_count
                ));
            }
            if a.owner.is_none() && !live.is_empty() {
                return Err(format!("partition {} has no owner", a.partition));
            }
        }
        Ok(())
    }
}

/// Drops dead replicas and promotes the first surviving backup of every partition
/// whose owner died. In-flight migrations towards dead nodes are dropped too.
pub fn strip_dead(current: &[PartitionAssignment], live: &[NodeId]) -> Vec<PartitionAssignment> {
    let live: HashSet<&NodeId> = live.iter().collect();
    current
        .iter()
        .map(|a| {
            let mut survivors: Vec<NodeId> = Vec::new();
            for replica in a.replicas() {
                if live.contains(replica) && !survivors.contains(replica) {
                    survivors.push(replica.clone());
                }
            }
            let mut survivors = survivors.into_iter();
            PartitionAssignment {
                partition: a.partition,
                owner: survivors.next(),
                backups: survivors.collect(),
                incoming: a
                    .incoming
                    .iter()
                    .filter(|n| live.contains(n))
                    .cloned()
                    .collect(),
            }
        })
        .collect()
}

/// Computes the target placement for `live` nodes starting from `current`.
///
/// Owners end up balanced within one partition per node. Surviving replicas stay
/// where they are: only the excess of over-quota owners moves, a displaced owner
/// becomes the first backup, and a partition is preferably handed to a node that
/// already holds it as a backup. Backups are then topped up to
/// `min(backup_count, live - 1)` from the least loaded nodes.
pub fn rebalance(
    current: &[PartitionAssignment],
    live: &[NodeId],
    backup_count: usize,
) -> Vec<PartitionAssignment> {
    let mut live: Vec<NodeId> = live.to_vec();
    live.sort();
    live.dedup();

    let mut target = strip_dead(current, &live);
    for a in target.iter_mut() {
        a.incoming.clear();
    }
    if live.is_empty() {
        return target;
    }

    // Owner quotas.
    let mut owned: BTreeMap<NodeId, usize> = live.iter().map(|n| (n.clone(), 0)).collect();
    for owner in target.iter().filter_map(|a| a.owner.as_ref()) {
        if let Some(count) = owned.get_mut(owner) {
            *count += 1;
        }
    }
    let partition_count = target.len();
    let base = partition_count / live.len();
    let extra = partition_count % live.len();
    let mut by_load: Vec<&NodeId> = live.iter().collect();
    by_load.sort_by(|a, b| owned[*b].cmp(&owned[*a]).then_with(|| a.cmp(b)));
    let quota: BTreeMap<NodeId, usize> = by_load
        .iter()
        .enumerate()
        .map(|(i, n)| ((*n).clone(), if i < extra { base + 1 } else { base }))
        .collect();

    // Over-quota owners release their highest partitions and stay on as first backup.
    let mut pending: Vec<usize> = Vec::new();
    for idx in (0..target.len()).rev() {
        let Some(owner) = target[idx].owner.clone() else {
            pending.push(idx);
            continue;
        };
        if owned[&owner] > quota[&owner] {
            if let Some(count) = owned.get_mut(&owner) {
                *count -= 1;
            }
            let a = &mut target[idx];
            a.owner = None;
            a.backups.insert(0, owner);
            pending.push(idx);
        }
    }
    pending.sort_unstable();

    for idx in pending {
        let a = &mut target[idx];
        let from_backups = a
            .backups
            .iter()
            .position(|b| owned.get(b).copied().unwrap_or(usize::MAX) < quota[b]);
        let new_owner = match from_backups {
            Some(pos) => a.backups.remove(pos),
            None => {
                let Some(node) = live
                    .iter()
                    .filter(|n| owned[*n] < quota[*n])
                    .min_by(|x, y| owned[*x].cmp(&owned[*y]).then_with(|| x.cmp(y)))
                else {
                    continue;
                };
                a.backups.retain(|b| b != node);
                node.clone()
            }
        };
        if let Some(count) = owned.get_mut(&new_owner) {
            *count += 1;
        }
        a.owner = Some(new_owner);
    }

    // Backups.
    let wanted = backup_count.min(live.len() - 1);
    let mut backed: BTreeMap<NodeId, usize> = live.iter().map(|n| (n.clone(), 0)).collect();
    for a in target.iter_mut() {
        a.backups.truncate(wanted);
        for b in &a.backups {
            if let Some(count) = backed.get_mut(b) {
                *count += 1;
            }
        }
    }
    for a in target.iter_mut() {
        while a.backups.len() < wanted {
            let candidate = live
                .iter()
                .filter(|n| !a.is_replica(n))
                .min_by(|x, y| backed[*x].cmp(&backed[*y]).then_with(|| x.cmp(y)))
                .cloned();
            let Some(node) = candidate else {
                break;
            };
            if let Some(count) = backed.get_mut(&node) {
                *count += 1;
            }
            a.backups.push(node);
        }
    }

    target
}

/// Nodes that appear as replicas in `target` but hold no data for the partition in
/// `current`: the destinations of a migration.
pub fn new_replicas(current: &PartitionAssignment, target: &PartitionAssignment) -> Vec<NodeId> {
    target
        .replicas()
        .filter(|n| !current.is_replica(n))
        .cloned()
        .collect()
}
