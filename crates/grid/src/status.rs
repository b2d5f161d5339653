//! Read-only snapshots returned by the query interface.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use amp_core::{Priority, Task, TaskId, TaskStatus};

use crate::metrics::GridMetrics;

/// Public fields of one task at the moment of the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub task_type: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub execution_context_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Run time in seconds, once finished.
    pub duration_secs: Option<f64>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id(),
            task_type: task.task_type().to_string(),
            priority: task.priority(),
            status: task.status(),
            created_at: task.created_at(),
            started_at: task.started_at(),
            completed_at: task.completed_at(),
            worker_id: task.worker_id().map(str::to_string),
            execution_context_id: task.execution_context_id().map(str::to_string),
            result: task.result().cloned(),
            error: task.error().map(str::to_string),
            duration_secs: task.duration().map(duration_secs),
        }
    }
}

pub(crate) fn duration_secs(d: chrono::Duration) -> f64 {
    d.num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| d.num_milliseconds() as f64 / 1_000.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusView {
    pub worker_id: String,
    pub worker_type: String,
    pub active_tasks: Vec<TaskId>,
    pub active_count: usize,
    pub capacity: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub is_active: bool,
    pub last_heartbeat: DateTime<Utc>,
}

/// Whole-grid snapshot: metrics, per-worker state, queue depth and the
/// number of RUNNING tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridStatusView {
    pub metrics: GridMetrics,
    pub workers: BTreeMap<String, WorkerStatusView>,
    pub queue_depth: usize,
    /// Pending tasks at each priority level.
    #[serde(default)]
    pub pending_by_priority: BTreeMap<Priority, usize>,
    pub running_tasks: usize,
    pub uptime_secs: f64,
}

impl GridStatusView {
    /// Sum of worker capacities.
    pub fn total_capacity(&self) -> usize {
        self.workers.values().map(|w| w.capacity).sum()
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.queue_depth == 0 && self.running_tasks == 0
    }
}

impl fmt::Display for GridStatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        let m = &self.metrics;
        writeln!(f, "{rule}")?;
        writeln!(f, "AMP THREAD GRID STATUS")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Total tasks:    {}", m.total_submitted)?;
        writeln!(f, "Completed:      {}", m.total_completed)?;
        writeln!(f, "Failed:         {}", m.total_failed)?;
        writeln!(f, "Cancelled:      {}", m.total_cancelled)?;
        writeln!(f, "Active workers: {}", m.active_workers)?;
        writeln!(f, "Queue depth:    {}", self.queue_depth)?;
        let by_priority: Vec<String> = self
            .pending_by_priority
            .iter()
            .filter(|(_, &n)| n > 0)
            .map(|(p, n)| format!("{p}={n}"))
            .collect();
        if !by_priority.is_empty() {
            writeln!(f, "  by priority:  {}", by_priority.join(" "))?;
        }
        writeln!(f, "Running tasks:  {}/{}", self.running_tasks, self.total_capacity())?;
        writeln!(f, "Uptime:         {:.1}s", self.uptime_secs)?;
        writeln!(f)?;
        writeln!(f, "WORKERS:")?;
        for (id, w) in &self.workers {
            let state = if w.is_active { "" } else { " (inactive)" };
            writeln!(
                f,
                "  {id}: {}/{} slots, completed {} failed {}{state}",
                w.active_count, w.capacity, w.completed_tasks, w.failed_tasks
            )?;
        }
        write!(f, "{rule}")
    }
}
