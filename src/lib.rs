//! memgrid: Partitioned In-Memory Data Grid
//!
//! This library crate defines the modules of a grid node. The binary (`main.rs`)
//! wires them to UDP gossip and HTTP; tests and embedders run whole clusters in one
//! process through `cluster::LocalCluster`.
//!
//! ## Architecture Modules
//! - **`membership`**: gossip-based discovery and failure detection, publishing
//!   versioned membership events.
//! - **`partition`**: the partition table and the director that rebalances it and
//!   migrates partition data when membership changes.
//! - **`storage`**: partition containers, replicated maps with TTL and eviction,
//!   op-log replication to backups.
//! - **`primitives`**: distributed queues and publish/subscribe topics.
//! - **`cp`**: Raft-replicated sessions and re-entrant locks.
//! - **`executor`**: named worker pools running registered task handlers.
//! - **`wal`**: optional per-partition write-ahead log.
//! - **`transport`**: the node-to-node call interface, in-process or over HTTP.
//! - **`cluster`**: per-node context, client routing and HTTP routes.
//! - **`config`**, **`error`**: grid configuration and the error type.

pub mod cluster;
pub mod config;
pub mod cp;
pub mod error;
pub mod executor;
pub mod membership;
pub mod partition;
pub mod primitives;
pub mod storage;
pub mod transport;
pub mod wal;
