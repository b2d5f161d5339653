//! Runner tests that drive dispatch and heartbeat ticks by hand instead of
//! through the background loops.

use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use amp_core::{
    GridConfig, Payload, Priority, RetentionPolicy, TaskId, TaskStatus, WorkerPoolConfig,
};

use crate::handler::{HandlerResult, TaskContext};
use crate::runner::{CancelOutcome, Grid};
use crate::sink::{FnSink, GridEvent};
use crate::status::TaskStatusView;

fn config(pools: &[(&str, usize, usize)]) -> GridConfig {
    GridConfig::with_workers(
        pools
            .iter()
            .map(|&(kind, count, capacity)| WorkerPoolConfig::new(kind, count, capacity))
            .collect(),
    )
}

/// Running flag set, no loops, no pools: dispatched tasks run inline on
/// the calling thread.
fn inline_grid(config: GridConfig) -> Grid {
    let grid = Grid::new(config).unwrap();
    grid.shared.running.store(true, Ordering::Release);
    grid
}

/// Running flag set and worker pools live, still without the loops.
fn pooled_grid(config: GridConfig) -> Grid {
    let grid = inline_grid(config);
    for worker in grid.shared.workers.values() {
        worker.start_pool().unwrap();
    }
    grid
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn status(grid: &Grid, id: TaskId) -> TaskStatus {
    grid.get_task_status(&id).unwrap().status
}

fn wait_terminal(grid: &Grid, id: TaskId) -> TaskStatusView {
    assert!(
        wait_until(|| status(grid, id).is_terminal()),
        "task {id} did not finish"
    );
    grid.get_task_status(&id).unwrap()
}

fn submit(grid: &Grid, task_type: &str, priority: Priority) -> TaskId {
    grid.submit(task_type, Payload::new(), priority).unwrap()
}

fn recording_handler(grid: &Grid, task_type: &str) -> Arc<Mutex<Vec<TaskId>>> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    grid.register_handler(task_type, move |ctx: &TaskContext<'_>| -> HandlerResult {
        seen.lock().unwrap().push(ctx.task_id);
        Ok(json!({ "worker": ctx.worker_id }))
    });
    order
}

/// Loops until cancelled, giving up after five seconds.
fn cooperative(ctx: &TaskContext<'_>) -> HandlerResult {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        ctx.check_cancelled()?;
        thread::sleep(Duration::from_millis(5));
    }
    Ok(json!("ran to completion"))
}

#[test]
fn dispatch_fills_capacity_then_waits_for_a_slot() {
    let grid = pooled_grid(config(&[("scan", 1, 2)]));
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));
    grid.register_handler("scan", move |_: &TaskContext<'_>| -> HandlerResult {
        release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5))?;
        Ok(json!("done"))
    });

    let ids: Vec<TaskId> = (0..3).map(|_| submit(&grid, "scan", Priority::Normal)).collect();

    assert_eq!(grid.shared.dispatch_pass(), 2);
    assert_eq!(status(&grid, ids[0]), TaskStatus::Running);
    assert_eq!(status(&grid, ids[1]), TaskStatus::Running);
    assert_eq!(status(&grid, ids[2]), TaskStatus::Pending);

    let view = grid.get_grid_status();
    assert_eq!(view.running_tasks, 2);
    assert_eq!(view.queue_depth, 1);
    assert_eq!(view.workers["scan_1"].active_count, 2);

    // Full worker: nothing more to start.
    assert_eq!(grid.shared.dispatch_pass(), 0);

    release_tx.send(()).unwrap();
    assert!(wait_until(|| grid.get_grid_status().running_tasks == 1));
    assert_eq!(grid.shared.dispatch_pass(), 1);
    assert_eq!(status(&grid, ids[2]), TaskStatus::Running);

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    for id in &ids {
        assert_eq!(wait_terminal(&grid, *id).status, TaskStatus::Completed);
    }
    assert!(wait_until(|| grid.get_grid_status().workers["scan_1"].completed_tasks == 3));
}

#[test]
fn critical_is_dispatched_before_earlier_low() {
    let grid = inline_grid(config(&[("scan", 1, 1)]));
    let order = recording_handler(&grid, "scan");

    let low = submit(&grid, "scan", Priority::Low);
    let critical = submit(&grid, "scan", Priority::Critical);

    assert_eq!(grid.shared.dispatch_pass(), 2);
    assert_eq!(*order.lock().unwrap(), vec![critical, low]);
}

#[test]
fn equal_priorities_run_in_submission_order() {
    let grid = inline_grid(config(&[("scan", 1, 1)]));
    let order = recording_handler(&grid, "scan");

    let ids: Vec<TaskId> = (0..5).map(|_| submit(&grid, "scan", Priority::High)).collect();
    assert_eq!(grid.shared.dispatch_pass(), 5);
    assert_eq!(*order.lock().unwrap(), ids);
}

#[test]
fn blocked_type_does_not_hold_back_other_types() {
    let grid = inline_grid(config(&[("scan", 1, 1), ("log", 1, 1)]));
    recording_handler(&grid, "scan");
    recording_handler(&grid, "log");
    grid.set_worker_active("scan_1", false).unwrap();

    let scan = submit(&grid, "scan", Priority::Critical);
    let log = submit(&grid, "log", Priority::Low);

    assert_eq!(grid.shared.dispatch_pass(), 1);
    assert_eq!(status(&grid, scan), TaskStatus::Pending);
    assert_eq!(status(&grid, log), TaskStatus::Completed);

    grid.set_worker_active("scan_1", true).unwrap();
    assert_eq!(grid.shared.dispatch_pass(), 1);
    assert_eq!(status(&grid, scan), TaskStatus::Completed);
}

#[test]
fn missing_handler_fails_the_task() {
    let grid = inline_grid(config(&[("general", 1, 1)]));
    let id = submit(&grid, "ghost", Priority::Normal);

    assert_eq!(grid.shared.dispatch_pass(), 1);
    let view = grid.get_task_status(&id).unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(
        view.error.as_deref(),
        Some("no handler registered for task type 'ghost'")
    );
    assert_eq!(view.worker_id.as_deref(), Some("general_1"));
    assert!(view.completed_at.unwrap() >= view.started_at.unwrap());

    let status = grid.get_grid_status();
    assert_eq!(status.metrics.total_failed, 1);
    assert_eq!(status.workers["general_1"].failed_tasks, 1);
    assert_eq!(status.workers["general_1"].active_count, 0);
}

#[test]
fn handler_error_text_is_recorded() {
    let grid = inline_grid(config(&[("scan", 1, 1)]));
    grid.register_handler("scan", |ctx: &TaskContext<'_>| -> HandlerResult {
        let target = ctx
            .payload
            .get("target")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("payload has no target"))?;
        Ok(json!(target))
    });

    let id = submit(&grid, "scan", Priority::Normal);
    grid.shared.dispatch_pass();
    let view = grid.get_task_status(&id).unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.error.as_deref(), Some("payload has no target"));
    assert!(view.result.is_none());
}

#[test]
fn heartbeat_stamps_workers_and_publishes_status() {
    let grid = inline_grid(config(&[("scan", 2, 1)]));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    grid.attach_sink(Arc::new(FnSink::new(move |e: &GridEvent| {
        sink_events.lock().unwrap().push(e.clone())
    })));
    grid.set_worker_active("scan_2", false).unwrap();

    let now = Utc::now() + chrono::Duration::seconds(1);
    grid.shared.heartbeat_tick(now);

    let status = grid.get_grid_status();
    assert_eq!(status.metrics.active_workers, 1);
    assert_eq!(status.workers["scan_1"].last_heartbeat, now);
    assert_eq!(status.workers["scan_2"].last_heartbeat, now);

    let events = events.lock().unwrap();
    match events.last() {
        Some(GridEvent::GridStatus(view)) => assert_eq!(view.workers.len(), 2),
        other => panic!("expected grid_status event, got {other:?}"),
    }
}

#[test]
fn soft_timeout_signals_running_handler() {
    let mut cfg = config(&[("scan", 1, 1)]);
    cfg.handler_timeout_secs = Some(0);
    let grid = pooled_grid(cfg);
    grid.register_handler("scan", cooperative);

    let id = submit(&grid, "scan", Priority::Normal);
    assert_eq!(grid.shared.dispatch_pass(), 1);
    assert_eq!(status(&grid, id), TaskStatus::Running);

    grid.shared.heartbeat_tick(Utc::now() + chrono::Duration::seconds(1));
    let view = wait_terminal(&grid, id);
    assert_eq!(view.status, TaskStatus::Failed);
    assert!(view.error.unwrap().contains("cancelled"));
}

#[test]
fn cancel_running_task_signals_token() {
    let grid = pooled_grid(config(&[("scan", 1, 1)]));
    grid.register_handler("scan", cooperative);

    let id = submit(&grid, "scan", Priority::Normal);
    assert_eq!(grid.shared.dispatch_pass(), 1);
    assert_eq!(grid.cancel(id), CancelOutcome::Signalled);

    let view = wait_terminal(&grid, id);
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(grid.cancel(id), CancelOutcome::AlreadyFinished);
    assert!(wait_until(|| grid.shared.tokens.lock().unwrap().is_empty()));
}

#[test]
fn panicking_sink_does_not_disturb_the_grid() {
    let grid = inline_grid(config(&[("scan", 1, 1)]));
    grid.attach_sink(Arc::new(FnSink::new(|_: &GridEvent| panic!("sink down"))));
    recording_handler(&grid, "scan");

    let id = submit(&grid, "scan", Priority::Normal);
    assert_eq!(grid.shared.dispatch_pass(), 1);
    assert_eq!(status(&grid, id), TaskStatus::Completed);
    grid.shared.heartbeat_tick(Utc::now());
}

#[test]
fn ttl_retention_is_swept_on_heartbeat() {
    let mut cfg = config(&[("scan", 1, 1)]);
    cfg.retention = RetentionPolicy::Ttl { secs: 60 };
    let grid = inline_grid(cfg);
    recording_handler(&grid, "scan");

    let id = submit(&grid, "scan", Priority::Normal);
    grid.shared.dispatch_pass();
    assert!(grid.get_task_status(&id).is_some());

    grid.shared.heartbeat_tick(Utc::now() + chrono::Duration::seconds(120));
    assert!(grid.get_task_status(&id).is_none());

    let metrics = grid.metrics();
    assert_eq!(metrics.total_evicted, 1);
    assert_eq!(metrics.total_completed, 1);
    assert_eq!(metrics.total_submitted, 1);
}

#[test]
fn stale_entry_is_skipped() {
    let grid = inline_grid(config(&[("scan", 1, 1)]));
    recording_handler(&grid, "scan");
    let id = submit(&grid, "scan", Priority::Normal);
    let entry = grid.shared.queue.lock().unwrap().peek().cloned().unwrap();

    assert_eq!(grid.cancel(id), CancelOutcome::Cancelled);
    assert_eq!(
        grid.shared.try_dispatch(&entry),
        super::scheduling::Dispatch::Stale
    );
    assert_eq!(status(&grid, id), TaskStatus::Cancelled);
}
