//! Simulated security handlers used by the demo.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::info;

use amp_grid::{Grid, HandlerResult, Payload, TaskContext};

/// Task type, simulated run time in seconds, result builder.
const SECURITY_HANDLERS: &[(&str, f64, fn(&Payload) -> Value)] = &[
    ("threat_scan", 2.0, threat_scan),
    ("packet_analysis", 1.5, packet_analysis),
    ("vulnerability_scan", 3.0, vulnerability_scan),
    ("log_processing", 0.5, log_processing),
    ("ai_analysis", 4.0, ai_analysis),
    ("network_monitoring", 1.0, network_monitoring),
];

pub fn register_security_handlers(grid: &Grid, time_scale: f64) {
    let time_scale = time_scale.max(0.0);
    for &(task_type, secs, build) in SECURITY_HANDLERS {
        grid.register_handler(task_type, move |ctx: &TaskContext<'_>| -> HandlerResult {
            info!(
                task_id = %ctx.task_id.short(),
                worker = ctx.worker_id,
                task_type = ctx.task_type,
                "simulating work"
            );
            let total = Duration::try_from_secs_f64(secs * time_scale)
                .map_err(|e| anyhow::anyhow!("invalid simulated run time: {e}"))?;
            simulate(ctx, total)?;
            Ok(build(ctx.payload))
        });
    }
}

/// Sleep for `total` in short steps, bailing out once cancelled.
fn simulate(ctx: &TaskContext<'_>, total: Duration) -> anyhow::Result<()> {
    const STEP: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    loop {
        ctx.check_cancelled()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(STEP.min(deadline - now));
    }
}

fn u64_field(payload: &Payload, key: &str, default: u64) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn str_field<'a>(payload: &'a Payload, key: &str, default: &'a str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn threat_scan(payload: &Payload) -> Value {
    json!({
        "threats_found": u64_field(payload, "scan_count", 0) / 10,
        "scan_type": str_field(payload, "scan_type", "full"),
        "status": "completed",
        "scan_duration": 2.0,
    })
}

fn packet_analysis(payload: &Payload) -> Value {
    let packets = u64_field(payload, "packet_count", 100);
    json!({
        "packets_analyzed": packets,
        "suspicious_packets": packets / 10,
        "analysis_complete": true,
    })
}

fn vulnerability_scan(payload: &Payload) -> Value {
    json!({
        "vulnerabilities_found": u64_field(payload, "target_count", 1) * 2,
        "severity_high": 1,
        "severity_medium": 3,
        "severity_low": 2,
    })
}

fn log_processing(payload: &Payload) -> Value {
    let logs = u64_field(payload, "log_count", 1000);
    json!({
        "logs_processed": logs,
        "alerts_generated": logs / 100,
        "processing_time": 0.5,
    })
}

fn ai_analysis(payload: &Payload) -> Value {
    json!({
        "analysis_type": str_field(payload, "analysis_type", "behavior"),
        "confidence_score": 0.87,
        "recommendation": "Monitor closely",
        "ai_model_used": "SentinelAI-v2",
    })
}

fn network_monitoring(payload: &Payload) -> Value {
    let connections = u64_field(payload, "connection_count", 50);
    json!({
        "connections_monitored": connections,
        "anomalies_detected": connections / 20,
        "bandwidth_usage": "75%",
    })
}
