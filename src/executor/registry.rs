//! Task Handler Registry
//!
//! Maps handler names to async closures. Tasks carry only the name and a JSON
//! payload, so every node that may run a task registers the same handlers.

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous task handler function.
/// It takes the task payload and resolves to the value stored as the task result.
pub type TaskHandlerFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` under `handler_name`, replacing any earlier one.
    pub fn register<F, Fut>(&self, handler_name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        // Box::pin erases the concrete future type so different handlers share the map.
        let handler_fn: TaskHandlerFn = Arc::new(move |payload: Value| {
            Box::pin(handler(payload)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });

        self.handlers.insert(handler_name.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", handler_name);
    }

    /// Runs the handler registered under `handler_name`.
    pub async fn execute(&self, handler_name: &str, payload: Value) -> Result<Value> {
        // Clone out of the map so no shard lock is held across the await.
        let handler_fn = self
            .handlers
            .get(handler_name)
            .map(|entry| entry.value().clone());
        match handler_fn {
            Some(handler_fn) => {
                tracing::debug!(
                    "Executing task with handler '{}' (payload size: {} bytes)",
                    handler_name,
                    payload.to_string().len()
                );
                handler_fn(payload).await
            }
            None => {
                let error = format!("Unknown task handler: {}", handler_name);
                tracing::error!("{}", error);
                Err(anyhow::anyhow!(error))
            }
        }
    }

    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn has_handler(&self, handler_name: &str) -> bool {
        self.handlers.contains_key(handler_name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
