//! Partitioning Module
//!
//! Keys map to a fixed number of partitions (`partition_for`), partitions map to an
//! owner and an ordered list of backups (`PartitionTable`). A `PartitionAwareKey`
//! (`name@partition_key`) co-locates entries that share a partition key.
//!
//! ## Components
//! - **`table`**: the table itself and the pure placement functions (`strip_dead`,
//!   `rebalance`).
//! - **`director`**: reacts to membership events. The master computes the new
//!   placement, streams partition snapshots to new replicas and publishes tables.

pub mod director;
pub mod table;

pub use director::PartitionDirector;
pub use table::{
    PartitionAssignment, PartitionAwareKey, PartitionId, PartitionTable, partition_for,
    placement_key,
};

#[cfg(test)]
mod tests;
