use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use amp_core::TaskStatus;

use crate::handler::CancellationToken;
use crate::queue::QueueEntry;
use crate::sync::{lock, read, write};
use crate::worker::select_worker;

use super::core::GridShared;
use super::execution::Job;

/// What happened to one queue entry during a dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dispatch {
    Started,
    /// No eligible worker had a free slot; the entry kept its position.
    NoWorker,
    /// The entry was no longer queued or no longer PENDING.
    Stale,
}

impl GridShared {
    /// Scheduler thread body. Dispatches until stopped, idling when a pass
    /// makes no progress. Submissions and completions cut the idle short.
    pub(super) fn scheduler_loop(self: &Arc<Self>) {
        info!(
            idle_ms = self.config.scheduler_idle_ms,
            "scheduler loop started"
        );
        while self.is_running() {
            if self.dispatch_pass() == 0 {
                self.scheduler_wake.wait_timeout(self.config.scheduler_idle());
            }
        }
        info!("scheduler loop stopped");
    }

    /// Walk the queue once in priority order and start every task that has
    /// an eligible worker. Once a task type finds no worker, later entries of
    /// that type are skipped for the rest of the pass, so tasks of one type
    /// still start in queue order. Returns the number of tasks started.
    pub(super) fn dispatch_pass(self: &Arc<Self>) -> usize {
        let snapshot = lock(&self.queue).snapshot();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut started = 0;

        for entry in snapshot {
            if !self.is_running() {
                break;
            }
            if blocked.contains(&entry.task_type) {
                continue;
            }
            if !self.workers.values().any(|w| w.has_free_slot()) {
                break;
            }
            match self.try_dispatch(&entry) {
                Dispatch::Started => started += 1,
                Dispatch::NoWorker => {
                    blocked.insert(entry.task_type);
                }
                Dispatch::Stale => {}
            }
        }
        started
    }

    pub(super) fn try_dispatch(self: &Arc<Self>, entry: &QueueEntry) -> Dispatch {
        let job = {
            let mut queue = lock(&self.queue);
            if !queue.remove(entry) {
                return Dispatch::Stale;
            }
            let mut tasks = write(&self.tasks);
            let Some(task) = tasks.get_mut(&entry.task_id) else {
                return Dispatch::Stale;
            };
            if task.status() != TaskStatus::Pending {
                return Dispatch::Stale;
            }

            let Some(worker) = select_worker(self.workers.values(), &entry.task_type) else {
                queue.push(entry.clone());
                return Dispatch::NoWorker;
            };
            let Some(reservation) = worker.try_reserve(entry.task_id) else {
                queue.push(entry.clone());
                return Dispatch::NoWorker;
            };

            let context_id = worker.execution_context_id(reservation);
            if let Err(e) = task.start(worker.id(), context_id) {
                worker.abandon(reservation, entry.task_id);
                warn!(task_id = %entry.task_id, error = %e, "task could not start");
                return Dispatch::Stale;
            }

            let token = CancellationToken::new();
            lock(&self.tokens).insert(entry.task_id, token.clone());
            Job {
                task_id: entry.task_id,
                task_type: entry.task_type.clone(),
                payload: task.payload().clone(),
                worker: Arc::clone(worker),
                reservation,
                token,
            }
        };

        debug!(
            task_id = %job.task_id,
            task_type = %job.task_type,
            worker = job.worker.id(),
            slot = job.reservation.slot,
            "task dispatched"
        );

        let handler = read(&self.handlers).get(&job.task_type);
        let worker = Arc::clone(&job.worker);
        let shared = Arc::clone(self);
        if let Err(run) = worker.spawn(move || shared.execute(job, handler)) {
            warn!(worker = worker.id(), "worker pool not running, executing inline");
            run();
        }
        Dispatch::Started
    }
}
