//! Queue and Topic Primitives
//!
//! Both are pinned to `partition_for(name)` and stored in the partition container
//! next to map records, so they replicate and migrate with the partition.
//!
//! - **`queue`**: FIFO queue with bounded capacity, non-blocking `poll`.
//! - **`topic`**: publish/subscribe with optional global ordering through the
//!   partition owner.

pub mod queue;
pub mod topic;

#[cfg(test)]
mod tests;
