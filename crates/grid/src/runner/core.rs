use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use amp_core::{
    GridConfig, GridError, GridResult, Payload, Priority, Task, TaskId, TaskRequest, TaskStatus,
};

use crate::handler::{CancellationToken, HandlerRegistry, HandlerResult, TaskContext, TaskHandler};
use crate::metrics::GridMetrics;
use crate::queue::{PendingQueue, QueueEntry};
use crate::registry::TaskRegistry;
use crate::sink::{GridEvent, StatusSink};
use crate::status::{GridStatusView, TaskStatusView};
use crate::sync::{lock, read, write, Wakeup};
use crate::worker::Worker;

/// Result of [`Grid::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was PENDING and is now CANCELLED.
    Cancelled,
    /// The task is RUNNING; its cancellation token was signalled.
    Signalled,
    /// The task had already reached a terminal state.
    AlreadyFinished,
    /// No task with this id (never submitted, or evicted by retention).
    NotFound,
}

/// State shared between the public handle, the loops and pool jobs.
pub(super) struct GridShared {
    pub(super) config: GridConfig,
    /// Fixed at construction, keyed by worker id.
    pub(super) workers: BTreeMap<String, Arc<Worker>>,
    pub(super) queue: Mutex<PendingQueue>,
    pub(super) tasks: RwLock<TaskRegistry>,
    pub(super) handlers: RwLock<HandlerRegistry>,
    pub(super) required_fields: RwLock<HashMap<String, Vec<String>>>,
    pub(super) sink: RwLock<Option<Arc<dyn StatusSink>>>,
    pub(super) metrics: RwLock<GridMetrics>,
    /// Cancellation tokens of RUNNING tasks.
    pub(super) tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    pub(super) sequence: AtomicU64,
    pub(super) running: AtomicBool,
    pub(super) scheduler_wake: Wakeup,
    pub(super) heartbeat_wake: Wakeup,
}

impl GridShared {
    pub(super) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Deliver an event to the attached sink, if any. A panicking sink is
    /// logged and otherwise ignored.
    pub(super) fn publish(&self, event: GridEvent) {
        let Some(sink) = read(&self.sink).clone() else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| sink.publish(&event))).is_err() {
            warn!(sink = sink.name(), event = event.kind(), "status sink panicked");
        }
    }

    pub(super) fn grid_status(&self) -> GridStatusView {
        let (queue_depth, pending_by_priority) = {
            let queue = lock(&self.queue);
            (queue.len(), queue.depth_by_priority())
        };
        let (running_tasks, evicted) = {
            let tasks = read(&self.tasks);
            (tasks.count_with_status(TaskStatus::Running), tasks.evicted())
        };
        let mut metrics = read(&self.metrics).clone();
        metrics.total_evicted = evicted;
        let uptime_secs = metrics.uptime(Utc::now()).as_secs_f64();

        GridStatusView {
            metrics,
            workers: self
                .workers
                .iter()
                .map(|(id, worker)| (id.clone(), worker.view()))
                .collect(),
            queue_depth,
            pending_by_priority,
            running_tasks,
            uptime_secs,
        }
    }
}

/// The priority task grid.
///
/// Construction only materializes workers; no thread runs until
/// [`Grid::start`]. Any number of grids may coexist in one process.
pub struct Grid {
    pub(super) shared: Arc<GridShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Grid {
    /// Build a grid from a validated config.
    pub fn new(config: GridConfig) -> GridResult<Self> {
        config.validate()?;
        let workers = Worker::from_topology(&config.workers);
        let required_fields = config
            .required_fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        info!(
            workers = workers.len(),
            capacity = config.total_capacity(),
            "grid created"
        );

        Ok(Self {
            shared: Arc::new(GridShared {
                tasks: RwLock::new(TaskRegistry::new(config.retention)),
                workers,
                queue: Mutex::new(PendingQueue::new()),
                handlers: RwLock::new(HandlerRegistry::new()),
                required_fields: RwLock::new(required_fields),
                sink: RwLock::new(None),
                metrics: RwLock::new(GridMetrics::default()),
                tokens: Mutex::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                running: AtomicBool::new(false),
                scheduler_wake: Wakeup::new(),
                heartbeat_wake: Wakeup::new(),
                config,
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.shared.config
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a closure as the handler for `task_type`, replacing any
    /// previous handler. Takes effect for tasks dispatched afterwards.
    pub fn register_handler<F>(&self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(&TaskContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_task_handler(task_type, Arc::new(handler));
    }

    pub fn register_task_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        if write(&self.shared.handlers).register(task_type.clone(), handler) {
            info!(task_type = %task_type, "handler replaced");
        } else {
            info!(task_type = %task_type, "handler registered");
        }
    }

    /// Task types with a registered handler, sorted.
    pub fn handler_types(&self) -> Vec<String> {
        read(&self.shared.handlers).task_types()
    }

    /// Declare payload keys that every `task_type` submission must carry.
    pub fn require_fields<I, S>(&self, task_type: impl Into<String>, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        write(&self.shared.required_fields).insert(task_type.into(), fields);
    }

    /// Attach a status sink, returning the previous one.
    pub fn attach_sink(&self, sink: Arc<dyn StatusSink>) -> Option<Arc<dyn StatusSink>> {
        debug!(sink = sink.name(), "status sink attached");
        write(&self.shared.sink).replace(sink)
    }

    pub fn detach_sink(&self) -> Option<Arc<dyn StatusSink>> {
        write(&self.shared.sink).take()
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Queue a task. Never requires a registered handler; a missing handler
    /// surfaces as FAILED once the task is dispatched.
    pub fn submit(&self, task_type: &str, payload: Payload, priority: Priority) -> GridResult<TaskId> {
        if task_type.trim().is_empty() {
            return Err(GridError::EmptyTaskType);
        }
        self.check_required_fields(task_type, &payload)?;

        let shared = &self.shared;
        let task_id = {
            let mut queue = lock(&shared.queue);
            if let Some(max) = shared.config.max_queue_depth {
                if queue.len() >= max {
                    return Err(GridError::QueueFull { depth: queue.len() });
                }
            }
            let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed);
            let task = Task::new(task_type, payload, priority, sequence);
            let task_id = task.id();
            queue.push(QueueEntry::for_task(&task));
            write(&shared.tasks).insert(task);
            write(&shared.metrics).total_submitted += 1;
            task_id
        };

        debug!(%task_id, task_type, %priority, "task queued");
        shared.publish(GridEvent::TaskSubmitted {
            task_id,
            task_type: task_type.to_string(),
            priority,
        });
        shared.scheduler_wake.notify();
        Ok(task_id)
    }

    /// Submit a request whose priority is given by name.
    pub fn submit_request(&self, request: TaskRequest) -> GridResult<TaskId> {
        let priority = request.priority()?;
        self.submit(&request.task_type, request.payload, priority)
    }

    fn check_required_fields(&self, task_type: &str, payload: &Payload) -> GridResult<()> {
        let required = read(&self.shared.required_fields);
        if let Some(fields) = required.get(task_type) {
            if let Some(missing) = fields.iter().find(|f| !payload.contains_key(f.as_str())) {
                return Err(GridError::MissingPayloadField {
                    task_type: task_type.to_string(),
                    field: missing.clone(),
                });
            }
        }
        Ok(())
    }

    // ── Cancellation ───────────────────────────────────────────────

    /// Cancel a task. PENDING tasks leave the queue immediately; RUNNING
    /// tasks only have their cancellation token signalled.
    pub fn cancel(&self, task_id: TaskId) -> CancelOutcome {
        let shared = &self.shared;
        let mut queue = lock(&shared.queue);
        let mut tasks = write(&shared.tasks);
        let Some(task) = tasks.get_mut(&task_id) else {
            return CancelOutcome::NotFound;
        };

        match task.status() {
            TaskStatus::Pending => {
                queue.remove(&QueueEntry::for_task(task));
                if let Err(e) = task.cancel() {
                    error!(%task_id, error = %e, "cancel of pending task rejected");
                    return CancelOutcome::AlreadyFinished;
                }
                tasks.mark_finished(task_id, Utc::now());
                write(&shared.metrics).total_cancelled += 1;
                info!(%task_id, "pending task cancelled");
                CancelOutcome::Cancelled
            }
            TaskStatus::Running => {
                if let Some(token) = lock(&shared.tokens).get(&task_id) {
                    token.cancel();
                }
                info!(%task_id, "cancellation signalled to running task");
                CancelOutcome::Signalled
            }
            _ => CancelOutcome::AlreadyFinished,
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Snapshot of one task, or `None` if the id is unknown or evicted.
    pub fn get_task_status(&self, task_id: &TaskId) -> Option<TaskStatusView> {
        read(&self.shared.tasks).get(task_id).map(TaskStatusView::from)
    }

    pub fn get_grid_status(&self) -> GridStatusView {
        self.shared.grid_status()
    }

    pub fn metrics(&self) -> GridMetrics {
        let mut metrics = read(&self.shared.metrics).clone();
        metrics.total_evicted = read(&self.shared.tasks).evicted();
        metrics
    }

    /// Worker ids in sorted order.
    pub fn worker_ids(&self) -> Vec<String> {
        self.shared.workers.keys().cloned().collect()
    }

    /// Enable or disable a worker. Disabled workers receive no new tasks;
    /// tasks already running on them finish normally.
    pub fn set_worker_active(&self, worker_id: &str, active: bool) -> GridResult<()> {
        let worker = self
            .shared
            .workers
            .get(worker_id)
            .ok_or_else(|| GridError::WorkerNotFound(worker_id.to_string()))?;
        worker.set_active(active);
        info!(worker = worker_id, active, "worker activation changed");
        if active {
            self.shared.scheduler_wake.notify();
        }
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Build the worker pools and spawn the scheduler and heartbeat loops.
    pub fn start(&self) -> GridResult<()> {
        let mut threads = lock(&self.threads);
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(GridError::AlreadyRunning);
        }

        if let Err(e) = self.spawn_all(&mut threads) {
            error!(error = %e, "grid start failed");
            self.shutdown(&mut threads);
            return Err(e);
        }

        info!(
            workers = self.shared.workers.len(),
            capacity = self.shared.config.total_capacity(),
            handlers = read(&self.shared.handlers).len(),
            "grid started"
        );
        Ok(())
    }

    fn spawn_all(&self, threads: &mut Vec<JoinHandle<()>>) -> GridResult<()> {
        for worker in self.shared.workers.values() {
            worker.start_pool()?;
        }
        {
            let mut metrics = write(&self.shared.metrics);
            metrics.started_at = Some(Utc::now());
            metrics.active_workers = self.shared.workers.values().filter(|w| w.is_active()).count();
        }

        let shared = Arc::clone(&self.shared);
        threads.push(spawn_loop("amp-grid-scheduler", move || shared.scheduler_loop())?);
        let shared = Arc::clone(&self.shared);
        threads.push(spawn_loop("amp-grid-heartbeat", move || shared.heartbeat_loop())?);
        Ok(())
    }

    /// Stop the loops and release the worker pools. PENDING tasks stay
    /// queued; RUNNING tasks finish in the background.
    pub fn stop(&self) {
        let mut threads = lock(&self.threads);
        if !self.shared.is_running() && threads.is_empty() {
            return;
        }
        self.shutdown(&mut threads);
        info!("grid stopped");
    }

    fn shutdown(&self, threads: &mut Vec<JoinHandle<()>>) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.scheduler_wake.notify();
        self.shared.heartbeat_wake.notify();
        for handle in threads.drain(..) {
            let name = handle.thread().name().unwrap_or("grid loop").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "grid loop panicked");
            }
        }
        for worker in self.shared.workers.values() {
            worker.stop_pool();
        }
    }
}

impl Drop for Grid {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_loop<F>(name: &str, f: F) -> GridResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| GridError::ThreadPool(format!("spawning {name}: {e}")))
}
