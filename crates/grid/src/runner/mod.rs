//! Grid runner: owns the shared state and drives the background loops.
//!
//! Split into focused submodules:
//! - `core`: Grid struct, construction, registration, submission, queries, lifecycle
//! - `scheduling`: dispatch pass and the scheduler loop
//! - `execution`: handler invocation on worker pools and completion bookkeeping
//! - `heartbeat`: worker stamping, retention sweep, soft timeouts, status events
//!
//! Lock order is queue -> tasks -> worker state. Metrics, tokens, handlers
//! and the sink slot are leaf locks.

mod core;
mod execution;
mod heartbeat;
mod scheduling;
#[cfg(test)]
mod tests;

pub use self::core::{CancelOutcome, Grid};
