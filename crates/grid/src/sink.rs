//! Status sinks: where grid lifecycle events go.
//!
//! The grid publishes a [`GridEvent`] on submission, on every finished
//! execution, and on each heartbeat tick. Publishing happens on grid threads,
//! so sinks must be cheap and non-blocking. A failing or panicking sink never
//! affects the grid.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use amp_core::{Priority, TaskId, TaskStatus};

use crate::status::GridStatusView;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GridEvent {
    TaskSubmitted {
        task_id: TaskId,
        task_type: String,
        priority: Priority,
    },
    TaskCompleted {
        task_id: TaskId,
        status: TaskStatus,
        worker_id: String,
        duration_secs: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GridStatus(GridStatusView),
}

impl GridEvent {
    /// Wire name of the event, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            GridEvent::TaskSubmitted { .. } => "task_submitted",
            GridEvent::TaskCompleted { .. } => "task_completed",
            GridEvent::GridStatus(_) => "grid_status",
        }
    }
}

/// Receives grid events.
pub trait StatusSink: Send + Sync {
    fn publish(&self, event: &GridEvent);

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "sink"
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn publish(&self, event: &GridEvent) {
        match event {
            GridEvent::TaskSubmitted {
                task_id,
                task_type,
                priority,
            } => tracing::info!(%task_id, task_type = %task_type, %priority, "task submitted"),
            GridEvent::TaskCompleted {
                task_id,
                status,
                worker_id,
                duration_secs,
                error: None,
            } => tracing::info!(%task_id, %status, worker = %worker_id, duration_secs, "task finished"),
            GridEvent::TaskCompleted {
                task_id,
                status,
                worker_id,
                duration_secs,
                error: Some(error),
            } => tracing::warn!(
                %task_id,
                %status,
                worker = %worker_id,
                duration_secs,
                error = %error,
                "task finished"
            ),
            GridEvent::GridStatus(view) => tracing::debug!(
                queue_depth = view.queue_depth,
                running = view.running_tasks,
                active_workers = view.metrics.active_workers,
                completed = view.metrics.total_completed,
                failed = view.metrics.total_failed,
                "grid status"
            ),
        }
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Fans events out over a `tokio::sync::broadcast` channel.
///
/// Sending never blocks; slow receivers observe `RecvError::Lagged`.
/// Receivers may be used from async code or via `blocking_recv`/`try_recv`.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<GridEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<GridEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl StatusSink for BroadcastSink {
    fn publish(&self, event: &GridEvent) {
        // Err only means nobody is subscribed right now.
        let _ = self.tx.send(event.clone());
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(&GridEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> StatusSink for FnSink<F>
where
    F: Fn(&GridEvent) + Send + Sync,
{
    fn publish(&self, event: &GridEvent) {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        "fn"
    }
}

/// Delivers each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn StatusSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl StatusSink for FanoutSink {
    fn publish(&self, event: &GridEvent) {
        for sink in &self.sinks {
            if panic::catch_unwind(AssertUnwindSafe(|| sink.publish(event))).is_err() {
                tracing::warn!(sink = sink.name(), event = event.kind(), "fanout member panicked");
            }
        }
    }

    fn name(&self) -> &str {
        "fanout"
    }
}
