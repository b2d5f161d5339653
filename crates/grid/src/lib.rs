//! Priority task grid: typed, capacity-bounded worker pools fed by a
//! priority queue, with lifecycle tracking and status events.

pub mod handler;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod sink;
pub mod status;
pub mod worker;

mod sync;

pub use amp_core::{
    GridConfig, GridError, GridResult, Payload, Priority, RetentionPolicy, Task, TaskId,
    TaskRequest, TaskStatus, WorkerPoolConfig,
};
pub use handler::{CancellationToken, HandlerRegistry, HandlerResult, TaskContext, TaskHandler};
pub use metrics::GridMetrics;
pub use runner::{CancelOutcome, Grid};
pub use sink::{BroadcastSink, FanoutSink, FnSink, GridEvent, StatusSink, TracingSink};
pub use status::{GridStatusView, TaskStatusView, WorkerStatusView};
pub use worker::GENERAL_WORKER_TYPE;
