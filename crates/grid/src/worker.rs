//! Typed, capacity-bounded workers, each with a private rayon thread pool.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use amp_core::{GridError, TaskId, WorkerPoolConfig};

use crate::status::WorkerStatusView;
use crate::sync::{lock, read, write};

/// Worker type that accepts every task type; a task of this type may also
/// run on any worker.
pub const GENERAL_WORKER_TYPE: &str = "general";

struct WorkerState {
    /// One entry per execution slot; `Some` while a task runs in it.
    slots: Vec<Option<TaskId>>,
    completed: u64,
    failed: u64,
    is_active: bool,
    last_heartbeat: DateTime<Utc>,
}

impl WorkerState {
    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// A reserved execution slot on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotReservation {
    pub slot: usize,
}

pub struct Worker {
    id: String,
    kind: String,
    capacity: usize,
    state: Mutex<WorkerState>,
    pool: RwLock<Option<Arc<rayon::ThreadPool>>>,
}

impl Worker {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            capacity,
            state: Mutex::new(WorkerState {
                slots: vec![None; capacity],
                completed: 0,
                failed: 0,
                is_active: true,
                last_heartbeat: Utc::now(),
            }),
            pool: RwLock::new(None),
        }
    }

    /// Materialize the worker set from a topology. Ids are `<type>_<n>`,
    /// numbered from 1 within each pool.
    pub fn from_topology(pools: &[WorkerPoolConfig]) -> BTreeMap<String, Arc<Worker>> {
        let mut workers = BTreeMap::new();
        for pool in pools {
            for i in 0..pool.count {
                let id = format!("{}_{}", pool.kind, i + 1);
                workers.insert(id.clone(), Arc::new(Worker::new(id, pool.kind.clone(), pool.capacity)));
            }
        }
        workers
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this worker may run tasks of `task_type`.
    pub fn accepts(&self, task_type: &str) -> bool {
        self.kind == task_type || self.kind == GENERAL_WORKER_TYPE || task_type == GENERAL_WORKER_TYPE
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).is_active
    }

    pub fn set_active(&self, active: bool) {
        lock(&self.state).is_active = active;
    }

    pub fn active_count(&self) -> usize {
        lock(&self.state).active_count()
    }

    /// Active count if this worker could take a task of `task_type` right now.
    pub fn available_load(&self, task_type: &str) -> Option<usize> {
        if !self.accepts(task_type) {
            return None;
        }
        let state = lock(&self.state);
        let active = state.active_count();
        (state.is_active && active < self.capacity).then_some(active)
    }

    pub fn has_free_slot(&self) -> bool {
        let state = lock(&self.state);
        state.is_active && state.active_count() < self.capacity
    }

    /// Claim the lowest free slot for `task_id`. Fails when the worker is
    /// inactive or full, so `active_count <= capacity` always holds.
    pub fn try_reserve(&self, task_id: TaskId) -> Option<SlotReservation> {
        let mut state = lock(&self.state);
        if !state.is_active {
            return None;
        }
        let slot = state.slots.iter().position(Option::is_none)?;
        state.slots[slot] = Some(task_id);
        Some(SlotReservation { slot })
    }

    /// Free a slot and count the outcome.
    pub fn release(&self, reservation: SlotReservation, task_id: TaskId, succeeded: bool) {
        let mut state = lock(&self.state);
        if !self.free_slot(&mut state, reservation, task_id) {
            return;
        }
        if succeeded {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
    }

    /// Free a slot whose task never started.
    pub fn abandon(&self, reservation: SlotReservation, task_id: TaskId) {
        let mut state = lock(&self.state);
        self.free_slot(&mut state, reservation, task_id);
    }

    fn free_slot(&self, state: &mut WorkerState, reservation: SlotReservation, task_id: TaskId) -> bool {
        match state.slots.get_mut(reservation.slot) {
            Some(slot) if *slot == Some(task_id) => {
                *slot = None;
                true
            }
            _ => {
                error!(worker = %self.id, %task_id, slot = reservation.slot, "release of a slot not held by task");
                false
            }
        }
    }

    pub fn heartbeat(&self, now: DateTime<Utc>) {
        lock(&self.state).last_heartbeat = now;
    }

    pub fn execution_context_id(&self, reservation: SlotReservation) -> String {
        format!("{}/slot-{}", self.id, reservation.slot)
    }

    // ── Thread pool lifecycle ─────────────────────────────────────────

    /// Build the worker's pool (`capacity` threads). No-op if already built.
    pub fn start_pool(&self) -> Result<(), GridError> {
        let mut pool = write(&self.pool);
        if pool.is_some() {
            return Ok(());
        }
        let worker_id = self.id.clone();
        let panic_worker = self.id.clone();
        let built = rayon::ThreadPoolBuilder::new()
            .num_threads(self.capacity)
            .thread_name(move |i| format!("{worker_id}-{i}"))
            .panic_handler(move |_| error!(worker = %panic_worker, "panic escaped task execution"))
            .build()
            .map_err(|e| GridError::ThreadPool(format!("worker {}: {e}", self.id)))?;
        *pool = Some(Arc::new(built));
        debug!(worker = %self.id, threads = self.capacity, "worker pool started");
        Ok(())
    }

    /// Drop the pool. Jobs already handed to it still run to completion.
    pub fn stop_pool(&self) {
        if write(&self.pool).take().is_some() {
            debug!(worker = %self.id, "worker pool released");
        }
    }

    /// Run `job` on this worker's pool. Hands the job back if the pool is
    /// not running.
    pub fn spawn<F>(&self, job: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match read(&self.pool).as_ref() {
            Some(pool) => {
                pool.spawn(job);
                Ok(())
            }
            None => Err(job),
        }
    }

    pub fn view(&self) -> WorkerStatusView {
        let state = lock(&self.state);
        WorkerStatusView {
            worker_id: self.id.clone(),
            worker_type: self.kind.clone(),
            active_count: state.active_count(),
            capacity: self.capacity,
            active_tasks: state.slots.iter().flatten().copied().collect(),
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            is_active: state.is_active,
            last_heartbeat: state.last_heartbeat,
        }
    }
}

/// Pick the least-loaded eligible worker for `task_type`; ties go to the
/// smallest worker id.
pub fn select_worker<'a, I>(workers: I, task_type: &str) -> Option<&'a Arc<Worker>>
where
    I: IntoIterator<Item = &'a Arc<Worker>>,
{
    workers
        .into_iter()
        .filter_map(|w| w.available_load(task_type).map(|load| (load, w)))
        .min_by(|(la, wa), (lb, wb)| la.cmp(lb).then_with(|| wa.id().cmp(wb.id())))
        .map(|(_, w)| w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn workers(layout: &[(&str, usize, usize)]) -> BTreeMap<String, Arc<Worker>> {
        let pools: Vec<_> = layout
            .iter()
            .map(|&(kind, count, cap)| WorkerPoolConfig::new(kind, count, cap))
            .collect();
        Worker::from_topology(&pools)
    }

    #[test]
    fn topology_ids_are_numbered_per_pool() {
        let ws = workers(&[("scan", 2, 4), ("log", 1, 1)]);
        let ids: Vec<&str> = ws.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["log_1", "scan_1", "scan_2"]);
        assert_eq!(ws["scan_2"].capacity(), 4);
        assert_eq!(ws["scan_2"].kind(), "scan");
    }

    #[test]
    fn reserve_never_exceeds_capacity() {
        let w = Worker::new("scan_1", "scan", 2);
        let a = w.try_reserve(TaskId::new()).unwrap();
        let b = w.try_reserve(TaskId::new()).unwrap();
        assert_ne!(a.slot, b.slot);
        assert!(w.try_reserve(TaskId::new()).is_none());
        assert_eq!(w.active_count(), 2);
    }

    #[test]
    fn release_frees_slot_and_counts_outcome() {
        let w = Worker::new("scan_1", "scan", 1);
        let id = TaskId::new();
        let r = w.try_reserve(id).unwrap();
        w.release(r, id, false);
        assert_eq!(w.active_count(), 0);

        let id2 = TaskId::new();
        let r2 = w.try_reserve(id2).unwrap();
        assert_eq!(r2.slot, 0);
        w.release(r2, id2, true);

        let view = w.view();
        assert_eq!(view.completed_tasks, 1);
        assert_eq!(view.failed_tasks, 1);
        assert!(view.active_tasks.is_empty());
    }

    #[test]
    fn abandon_frees_without_counting() {
        let w = Worker::new("scan_1", "scan", 1);
        let id = TaskId::new();
        let r = w.try_reserve(id).unwrap();
        w.abandon(r, id);
        let view = w.view();
        assert_eq!(view.active_count, 0);
        assert_eq!(view.completed_tasks + view.failed_tasks, 0);
    }

    #[test]
    fn release_with_wrong_task_is_ignored() {
        let w = Worker::new("scan_1", "scan", 1);
        let id = TaskId::new();
        let r = w.try_reserve(id).unwrap();
        w.release(r, TaskId::new(), true);
        assert_eq!(w.active_count(), 1);
        assert_eq!(w.view().completed_tasks, 0);
    }

    #[test]
    fn inactive_worker_is_never_reserved() {
        let w = Worker::new("scan_1", "scan", 4);
        w.set_active(false);
        assert!(w.try_reserve(TaskId::new()).is_none());
        assert!(w.available_load("scan").is_none());
    }

    #[test]
    fn accepts_matching_and_general() {
        let scan = Worker::new("scan_1", "scan", 1);
        let general = Worker::new("general_1", GENERAL_WORKER_TYPE, 1);
        assert!(scan.accepts("scan"));
        assert!(!scan.accepts("log"));
        assert!(scan.accepts(GENERAL_WORKER_TYPE));
        assert!(general.accepts("anything"));
    }

    #[test]
    fn select_prefers_least_loaded_then_id() {
        let ws = workers(&[("scan", 3, 2)]);
        ws["scan_1"].try_reserve(TaskId::new()).unwrap();

        let picked = select_worker(ws.values(), "scan").unwrap();
        assert_eq!(picked.id(), "scan_2");

        ws["scan_2"].try_reserve(TaskId::new()).unwrap();
        let picked = select_worker(ws.values(), "scan").unwrap();
        assert_eq!(picked.id(), "scan_3");

        ws["scan_3"].try_reserve(TaskId::new()).unwrap();
        let picked = select_worker(ws.values(), "scan").unwrap();
        assert_eq!(picked.id(), "scan_1");
    }

    #[test]
    fn select_skips_full_inactive_and_mismatched() {
        let ws = workers(&[("scan", 2, 1), ("log", 1, 1)]);
        ws["scan_1"].try_reserve(TaskId::new()).unwrap();
        ws["scan_2"].set_active(false);
        assert!(select_worker(ws.values(), "scan").is_none());
        assert_eq!(select_worker(ws.values(), "log").unwrap().id(), "log_1");
        assert!(select_worker(ws.values(), "ghost").is_none());
    }

    #[test]
    fn pool_runs_jobs_only_when_started() {
        let w = Worker::new("scan_1", "scan", 2);
        assert!(w.spawn(|| {}).is_err());

        w.start_pool().unwrap();
        let (tx, rx) = mpsc::channel();
        w.spawn(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).expect("send");
        })
        .unwrap_or_else(|_| panic!("pool not running"));
        let name = rx.recv_timeout(Duration::from_secs(2)).expect("job ran");
        assert!(name.unwrap().starts_with("scan_1-"));

        w.stop_pool();
        assert!(w.spawn(|| {}).is_err());
    }
}
