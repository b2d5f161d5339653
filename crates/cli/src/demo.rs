use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use amp_grid::{Grid, GridConfig, Payload, Priority, TaskId, TracingSink};

use crate::handlers::register_security_handlers;

pub struct DemoOptions {
    pub time_scale: f64,
    pub poll_secs: f64,
    pub json: bool,
}

/// Start a grid, submit one task per security handler, follow progress
/// until every task finishes, then print the results.
pub fn run(config: GridConfig, opts: DemoOptions) -> Result<()> {
    let grid = Grid::new(config).context("failed to build grid")?;
    register_security_handlers(&grid, opts.time_scale);
    grid.attach_sink(Arc::new(TracingSink));
    grid.start().context("failed to start grid")?;

    let submissions = [
        ("threat_scan", json!({ "scan_type": "comprehensive", "scan_count": 500 }), Priority::High),
        ("packet_analysis", json!({ "packet_count": 1000 }), Priority::Normal),
        ("vulnerability_scan", json!({ "target_count": 5 }), Priority::High),
        ("log_processing", json!({ "log_count": 2000 }), Priority::Low),
        ("ai_analysis", json!({ "analysis_type": "behavioral_anomaly" }), Priority::Critical),
        ("network_monitoring", json!({ "connection_count": 100 }), Priority::Normal),
    ];

    let mut ids = Vec::with_capacity(submissions.len());
    for (task_type, body, priority) in submissions {
        let payload: Payload = body.as_object().cloned().unwrap_or_default();
        let id = grid
            .submit(task_type, payload, priority)
            .with_context(|| format!("failed to submit {task_type}"))?;
        ids.push(id);
    }
    println!("Submitted {} tasks to the grid", ids.len());

    let poll = Duration::try_from_secs_f64(opts.poll_secs.max(0.01))
        .context("invalid poll interval")?;
    let mut finished = 0;
    while finished < ids.len() {
        thread::sleep(poll);
        let done = count_finished(&grid, &ids);
        if done > finished {
            finished = done;
            info!(finished, total = ids.len(), "progress");
            println!("\n{}", grid.get_grid_status());
        }
    }

    println!("\nAll tasks finished");
    print_results(&grid, &ids, opts.json)?;
    grid.stop();
    Ok(())
}

/// Terminal tasks, counting evicted ones as finished.
fn count_finished(grid: &Grid, ids: &[TaskId]) -> usize {
    ids.iter()
        .filter(|id| {
            grid.get_task_status(id)
                .map_or(true, |t| t.status.is_terminal())
        })
        .count()
}

fn print_results(grid: &Grid, ids: &[TaskId], as_json: bool) -> Result<()> {
    println!("\nTASK RESULTS:");
    println!("{}", "-".repeat(50));
    for (i, id) in ids.iter().enumerate() {
        let Some(view) = grid.get_task_status(id) else {
            println!("{}. {id} - evicted", i + 1);
            continue;
        };
        if as_json {
            println!("{}", serde_json::to_string_pretty(&view)?);
            continue;
        }

        println!(
            "{}. {} - {}",
            i + 1,
            view.task_type,
            view.status.as_str().to_uppercase()
        );
        println!("   Worker: {}", view.worker_id.as_deref().unwrap_or("-"));
        println!("   Duration: {:.2}s", view.duration_secs.unwrap_or(0.0));
        if let Some(result) = &view.result {
            println!("   Result: {}", serde_json::to_string_pretty(result)?);
        }
        if let Some(error) = &view.error {
            println!("   Error: {error}");
        }
        println!();
    }
    Ok(())
}
