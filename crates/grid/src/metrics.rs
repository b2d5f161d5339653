use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use amp_core::TaskStatus;

/// Grid-wide counters. Every counter is monotonic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridMetrics {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    /// Tasks dropped from the registry by the retention policy.
    pub total_evicted: u64,
    /// Workers that are active, as of the last heartbeat.
    pub active_workers: usize,
    pub started_at: Option<DateTime<Utc>>,
    /// Finished executions per task type.
    pub tasks_executed: HashMap<String, u64>,
    /// Rolling mean execution time per task type.
    #[serde(with = "duration_map_secs")]
    pub avg_task_duration: HashMap<String, Duration>,
}

impl GridMetrics {
    /// Count a finished execution and fold its duration into the per-type mean.
    pub fn record_execution(&mut self, task_type: &str, status: TaskStatus, duration: Duration) {
        match status {
            TaskStatus::Completed => self.total_completed += 1,
            TaskStatus::Failed => self.total_failed += 1,
            _ => return,
        }

        let count = self.tasks_executed.entry(task_type.to_string()).or_default();
        *count += 1;
        let count = *count;

        let avg = self.avg_task_duration.entry(task_type.to_string()).or_default();
        *avg = if count == 1 {
            duration
        } else {
            // new_avg = prev + (cur - prev) / n
            let prev = avg.as_secs_f64();
            let cur = duration.as_secs_f64();
            Duration::from_secs_f64((prev + (cur - prev) / count as f64).max(0.0))
        };
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        self.started_at
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default()
    }
}

mod duration_map_secs {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(map: &HashMap<String, Duration>, s: S) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (k, v.as_secs_f64()))
            .collect::<HashMap<_, _>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<HashMap<String, Duration>, D::Error> {
        let secs = HashMap::<String, f64>::deserialize(d)?;
        Ok(secs
            .into_iter()
            .map(|(k, v)| (k, Duration::from_secs_f64(v.max(0.0))))
            .collect())
    }
}
