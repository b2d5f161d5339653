pub mod config;
pub mod error;
pub mod task;

pub use config::{GridConfig, RetentionPolicy, WorkerPoolConfig};
pub use error::*;
pub use task::*;
