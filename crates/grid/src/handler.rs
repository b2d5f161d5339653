//! Task handlers: the caller-supplied work behind each task type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use amp_core::{Payload, TaskId};

/// Outcome of a handler: a JSON result, or any error (recorded as the
/// task's `error` text).
pub type HandlerResult = anyhow::Result<serde_json::Value>;

/// Cooperative cancellation flag shared between the grid and one running
/// handler. Handlers that never check it simply run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns true only for the first request.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Everything a handler sees about the task it is running.
#[derive(Debug)]
pub struct TaskContext<'a> {
    pub task_id: TaskId,
    pub task_type: &'a str,
    pub payload: &'a Payload,
    pub worker_id: &'a str,
    pub cancellation: &'a CancellationToken,
}

impl TaskContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Bail out with an error if cancellation was requested.
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("task {} cancelled", self.task_id);
        }
        Ok(())
    }
}

/// Performs the work for one task type.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, ctx: &TaskContext<'_>) -> HandlerResult;
}

impl<F> TaskHandler for F
where
    F: Fn(&TaskContext<'_>) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &TaskContext<'_>) -> HandlerResult {
        self(ctx)
    }
}

/// Task type -> handler table. Handlers are stored as trait objects so the
/// dispatch path only clones an `Arc`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the type.
    /// Returns true if a handler was replaced.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> bool {
        self.handlers.insert(task_type.into(), handler).is_some()
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
