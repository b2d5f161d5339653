use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use amp_core::{TaskId, TaskStatus};

use crate::sink::GridEvent;
use crate::sync::{lock, read, write};

use super::core::GridShared;

impl GridShared {
    /// Heartbeat thread body: one tick per interval until stopped.
    pub(super) fn heartbeat_loop(self: &Arc<Self>) {
        info!(interval_secs = self.config.heartbeat_secs, "heartbeat loop started");
        while self.is_running() {
            self.heartbeat_wake.wait_timeout(self.config.heartbeat_interval());
            if !self.is_running() {
                break;
            }
            self.heartbeat_tick(Utc::now());
        }
        info!("heartbeat loop stopped");
    }

    /// Stamp workers, refresh metrics, apply soft timeouts and retention,
    /// then publish a status snapshot.
    pub(super) fn heartbeat_tick(&self, now: DateTime<Utc>) {
        for worker in self.workers.values() {
            worker.heartbeat(now);
        }
        let active = self.workers.values().filter(|w| w.is_active()).count();
        write(&self.metrics).active_workers = active;

        let signalled = self.signal_overdue(now);
        let evicted = write(&self.tasks).sweep_expired(now);
        if signalled > 0 || evicted > 0 {
            debug!(signalled, evicted, "heartbeat maintenance");
        }

        self.publish(GridEvent::GridStatus(self.grid_status()));
    }

    /// Signal the cancellation token of every RUNNING task older than the
    /// handler timeout. Returns how many tokens were newly signalled.
    fn signal_overdue(&self, now: DateTime<Utc>) -> usize {
        let Some(timeout) = self.config.handler_timeout() else {
            return 0;
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };

        let overdue: Vec<TaskId> = read(&self.tasks)
            .iter()
            .filter(|t| t.status() == TaskStatus::Running)
            .filter(|t| t.started_at().is_some_and(|s| now - s >= timeout))
            .map(|t| t.id())
            .collect();
        if overdue.is_empty() {
            return 0;
        }

        let tokens = lock(&self.tokens);
        let mut signalled = 0;
        for task_id in overdue {
            if tokens.get(&task_id).is_some_and(|t| t.cancel()) {
                warn!(%task_id, timeout_secs = timeout.num_seconds(), "handler exceeded timeout, cancellation signalled");
                signalled += 1;
            }
        }
        signalled
    }
}
