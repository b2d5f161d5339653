use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum GridError {
    #[error("task type must not be empty")]
    EmptyTaskType,

    #[error("invalid priority '{0}', expected one of CRITICAL, HIGH, NORMAL, LOW")]
    InvalidPriority(String),

    #[error("payload for task type '{task_type}' is missing required field '{field}'")]
    MissingPayloadField { task_type: String, field: String },

    #[error("pending queue is full ({depth} tasks)")]
    QueueFull { depth: usize },

    #[error("task {task_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid task id '{0}'")]
    InvalidTaskId(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("grid is already running")]
    AlreadyRunning,

    #[error("thread pool error: {0}")]
    ThreadPool(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

pub type GridResult<T> = Result<T, GridError>;
