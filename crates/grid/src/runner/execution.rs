use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, warn};

use amp_core::{Payload, TaskId, TaskStatus};

use crate::handler::{CancellationToken, TaskContext, TaskHandler};
use crate::sink::GridEvent;
use crate::sync::{lock, write};
use crate::worker::{SlotReservation, Worker};

use super::core::GridShared;

/// A dispatched task, owned by the pool thread that runs it.
pub(super) struct Job {
    pub(super) task_id: TaskId,
    pub(super) task_type: String,
    pub(super) payload: Payload,
    pub(super) worker: Arc<Worker>,
    pub(super) reservation: SlotReservation,
    pub(super) token: CancellationToken,
}

impl GridShared {
    /// Run one job on the current pool thread. Handler errors, panics and a
    /// missing handler all end as FAILED; nothing escapes to the pool.
    pub(super) fn execute(&self, job: Job, handler: Option<Arc<dyn TaskHandler>>) {
        let clock = Instant::now();
        let outcome = match handler {
            None => Err(format!(
                "no handler registered for task type '{}'",
                job.task_type
            )),
            Some(handler) => {
                let ctx = TaskContext {
                    task_id: job.task_id,
                    task_type: &job.task_type,
                    payload: &job.payload,
                    worker_id: job.worker.id(),
                    cancellation: &job.token,
                };
                match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(payload) => Err(format!("handler panicked: {}", panic_message(&*payload))),
                }
            }
        };
        self.finish(job, outcome, clock.elapsed());
    }

    /// Record the outcome, free the worker slot and announce completion.
    fn finish(&self, job: Job, outcome: Result<serde_json::Value, String>, elapsed: Duration) {
        let (status, duration, error) = {
            let mut tasks = write(&self.tasks);
            let Some(task) = tasks.get_mut(&job.task_id) else {
                error!(task_id = %job.task_id, "finished task missing from registry");
                job.worker.release(job.reservation, job.task_id, outcome.is_ok());
                return;
            };

            let transition = match outcome {
                Ok(value) => task.complete(value),
                Err(message) => task.fail(message),
            };
            if let Err(e) = transition {
                error!(task_id = %job.task_id, error = %e, "task outcome rejected");
            }

            let status = task.status();
            let duration = task
                .duration()
                .and_then(|d| d.to_std().ok())
                .unwrap_or(elapsed);
            let error = task.error().map(str::to_string);
            let completed_at = task.completed_at().unwrap_or_else(Utc::now);

            job.worker
                .release(job.reservation, job.task_id, status == TaskStatus::Completed);
            write(&self.metrics).record_execution(&job.task_type, status, duration);
            tasks.mark_finished(job.task_id, completed_at);
            (status, duration, error)
        };
        lock(&self.tokens).remove(&job.task_id);

        match &error {
            None => debug!(task_id = %job.task_id, worker = job.worker.id(), ?duration, "task completed"),
            Some(e) => warn!(task_id = %job.task_id, worker = job.worker.id(), error = %e, "task failed"),
        }

        self.publish(GridEvent::TaskCompleted {
            task_id: job.task_id,
            status,
            worker_id: job.worker.id().to_string(),
            duration_secs: duration.as_secs_f64(),
            error,
        });
        self.scheduler_wake.notify();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
