use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GridError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

/// Grid configuration, parsed from TOML with `AMP_GRID_*` env overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// How long the scheduler waits when nothing is dispatchable.
    #[serde(default = "default_scheduler_idle_ms")]
    pub scheduler_idle_ms: u64,

    /// Heartbeat / status broadcast period.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Reject submissions once this many tasks are pending. Unset = unbounded.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,

    /// Signal cancellation to handlers running longer than this. Unset = never.
    #[serde(default)]
    pub handler_timeout_secs: Option<u64>,

    /// What happens to finished tasks in the registry.
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Static worker topology, materialized once at grid construction.
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerPoolConfig>,

    /// Payload keys each task type must carry: task type -> field names.
    #[serde(default)]
    pub required_fields: BTreeMap<String, Vec<String>>,
}

/// One `{type, count, capacity}` entry of the worker topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Task type served by these workers, or `general` for any type.
    #[serde(rename = "type")]
    pub kind: String,

    /// Number of workers of this type.
    #[serde(default = "default_count")]
    pub count: usize,

    /// Concurrent tasks per worker (threads in its pool).
    pub capacity: usize,
}

impl WorkerPoolConfig {
    pub fn new(kind: impl Into<String>, count: usize, capacity: usize) -> Self {
        Self {
            kind: kind.into(),
            count,
            capacity,
        }
    }
}

/// Eviction policy for finished tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep every task for the life of the grid.
    #[default]
    Unbounded,
    /// Keep at most `limit` finished tasks, evicting the oldest first.
    MaxFinished { limit: usize },
    /// Evict finished tasks older than `secs` seconds.
    Ttl { secs: u64 },
}

fn default_scheduler_idle_ms() -> u64 {
    100
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_count() -> usize {
    1
}

fn default_workers() -> Vec<WorkerPoolConfig> {
    vec![
        WorkerPoolConfig::new("threat_scan", 2, 4),
        WorkerPoolConfig::new("packet_analysis", 2, 6),
        WorkerPoolConfig::new("vulnerability_scan", 1, 8),
        WorkerPoolConfig::new("log_processing", 2, 3),
        WorkerPoolConfig::new("ai_analysis", 1, 2),
        WorkerPoolConfig::new("network_monitoring", 3, 4),
    ]
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            scheduler_idle_ms: default_scheduler_idle_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            max_queue_depth: None,
            handler_timeout_secs: None,
            retention: RetentionPolicy::default(),
            workers: default_workers(),
            required_fields: BTreeMap::new(),
        }
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl GridConfig {
    /// Config with the given topology and default timings.
    pub fn with_workers(workers: Vec<WorkerPoolConfig>) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, GridError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GridError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, GridError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn scheduler_idle(&self) -> Duration {
        Duration::from_millis(self.scheduler_idle_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }

    /// Total task-level parallelism: sum of all worker capacities.
    pub fn total_capacity(&self) -> usize {
        self.workers.iter().map(|w| w.count * w.capacity).sum()
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Convention: `AMP_GRID_KEY` overrides the top-level `key`.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("AMP_GRID_SCHEDULER_IDLE_MS") {
            self.scheduler_idle_ms = v;
        }
        if let Some(v) = env_parse::<u64>("AMP_GRID_HEARTBEAT_SECS") {
            self.heartbeat_secs = v;
        }
        if let Some(v) = env_parse::<usize>("AMP_GRID_MAX_QUEUE_DEPTH") {
            self.max_queue_depth = Some(v);
        }
        if let Some(v) = env_parse::<u64>("AMP_GRID_HANDLER_TIMEOUT_SECS") {
            self.handler_timeout_secs = Some(v);
        }
    }

    /// Validate topology and timings.
    pub fn validate(&self) -> Result<(), GridError> {
        if self.workers.is_empty() {
            return Err(GridError::Config(
                "worker topology is empty, at least one pool is required".into(),
            ));
        }
        for pool in &self.workers {
            if pool.kind.trim().is_empty() {
                return Err(GridError::Config("worker pool type must not be empty".into()));
            }
            if pool.count == 0 {
                return Err(GridError::Config(format!(
                    "worker pool '{}' has count 0",
                    pool.kind
                )));
            }
            if pool.capacity == 0 {
                return Err(GridError::Config(format!(
                    "worker pool '{}' has capacity 0",
                    pool.kind
                )));
            }
        }
        if self.scheduler_idle_ms == 0 {
            return Err(GridError::Config("scheduler_idle_ms must be positive".into()));
        }
        if self.heartbeat_secs == 0 {
            return Err(GridError::Config("heartbeat_secs must be positive".into()));
        }
        if self.max_queue_depth == Some(0) {
            return Err(GridError::Config("max_queue_depth must be positive when set".into()));
        }
        if let RetentionPolicy::MaxFinished { limit: 0 } = self.retention {
            return Err(GridError::Config("retention limit must be positive".into()));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Grid config loaded:");
        tracing::info!(
            "  scheduler:   idle={}ms, max_queue_depth={}",
            self.scheduler_idle_ms,
            self.max_queue_depth
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unbounded".into())
        );
        tracing::info!(
            "  heartbeat:   every {}s, handler_timeout={}",
            self.heartbeat_secs,
            self.handler_timeout_secs
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "none".into())
        );
        tracing::info!("  retention:   {:?}", self.retention);
        for pool in &self.workers {
            tracing::info!(
                "  pool:        {} x{} (capacity {})",
                pool.kind,
                pool.count,
                pool.capacity
            );
        }
    }
}
