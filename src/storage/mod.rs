//! Distributed Storage Module
//!
//! Implements the partition-level data layer: every partition holds a container of
//! named maps, queues and topics, mutated only at the partition owner and replicated
//! to backups as an ordered op log.
//!
//! ## Core Concepts
//! - **Container**: `PartitionContainer` stores the primitives of one partition and
//!   applies `PartitionOp`s idempotently by sequence number.
//! - **Store**: `PartitionStore` is the node's set of containers, one mutex each. It
//!   runs operations as owner, applies records as backup and takes part in migrations.
//! - **Replication**: `Replicator` ships op records to backups over ordered lanes;
//!   writes wait for the synchronous backups only.
//! - **Eviction**: `EvictionManager` sweeps maps with a TTL or a size bound.
//! - **Access**: `DistributedMap` is the client handle, routed through the gateway.

pub mod container;
pub mod eviction;
pub mod map;
pub mod replication;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
