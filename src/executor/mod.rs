//! Distributed Task Executor Module
//!
//! Named executors that run registered handlers on the cluster.
//!
//! ## Architecture Overview
//! 1. **Submission**: `DistributedExecutor::submit` writes a `Pending` record to the
//!    executor's results map and offers the task to the distributed queue named after
//!    the executor. A full queue rejects the task.
//! 2. **Execution**: the node owning the queue's partition runs a pool of workers that
//!    poll the queue and invoke the handler from the `TaskHandlerRegistry`.
//! 3. **Results**: workers record `Running`, then `Completed` with the handler's value
//!    or `Failed` with its error; `result(task_id)` reads the record back.
//!
//! ## Submodules
//! - **`types`**: task, task record and status.
//! - **`registry`**: maps handler names (e.g. "word_count") to async closures.
//! - **`service`**: worker pools and the client handle.

pub mod registry;
pub mod service;
pub mod types;

pub use registry::TaskHandlerRegistry;
pub use service::{DistributedExecutor, ExecutorService};
pub use types::{Task, TaskId, TaskRecord, TaskStatus};

#[cfg(test)]
mod tests;
