//! Cluster Module
//!
//! Ties the components of a node together and exposes them to callers.
//!
//! ## Components
//! - **`context`**: `ClusterContext`, built by `join` and stopped by `leave`. It owns
//!   the partition store, director, CP service, topic hub and executor pools, and is
//!   the node's `InboundHandler` for the transport.
//! - **`gateway`**: `GridClient`, which routes operations to partition owners and
//!   retries while the table is moving.
//! - **`embedded`**: `LocalCluster`, several nodes in one process over `LocalTransport`.
//! - **`handlers`**: client HTTP routes of the node binary.

pub mod context;
pub mod embedded;
pub mod gateway;
pub mod handlers;

pub use context::ClusterContext;
pub use embedded::LocalCluster;
pub use gateway::GridClient;

#[cfg(test)]
mod tests;
