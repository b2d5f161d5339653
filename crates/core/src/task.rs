//! Task data model: identity, priority, lifecycle status and the
//! transitions the grid is allowed to apply.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GridError;

/// Opaque key-value payload handed to a task handler.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Globally unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex characters, used in console output.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TaskId {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| GridError::InvalidTaskId(s.to_string()))
    }
}

/// Scheduling priority. Lower ordinal = served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Priority::Critical),
            "HIGH" => Ok(Priority::High),
            "NORMAL" => Ok(Priority::Normal),
            "LOW" => Ok(Priority::Low),
            _ => Err(GridError::InvalidPriority(s.to_string())),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The only reachable edges are PENDING -> RUNNING -> {COMPLETED, FAILED}
    /// and PENDING -> CANCELLED.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission request as received from an outer layer (JSON body, CLI).
///
/// `priority` is a name (`"HIGH"`) and defaults to NORMAL when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub priority: Option<String>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn priority(&self) -> Result<Priority, GridError> {
        match &self.priority {
            Some(name) => name.parse(),
            None => Ok(Priority::default()),
        }
    }
}

/// One unit of submitted work.
///
/// Identity fields are fixed at construction. Lifecycle fields only change
/// through the transition methods, which reject edges outside the state
/// machine described on [`TaskStatus::can_transition_to`].
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    task_type: String,
    priority: Priority,
    payload: Payload,
    sequence: u64,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    execution_context_id: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl Task {
    /// Create a PENDING task. `sequence` is the submission order used to
    /// break ties between equal priorities.
    pub fn new(
        task_type: impl Into<String>,
        payload: Payload,
        priority: Priority,
        sequence: u64,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            priority,
            payload,
            sequence,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            execution_context_id: None,
            result: None,
            error: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    pub fn execution_context_id(&self) -> Option<&str> {
        self.execution_context_id.as_deref()
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Wall-clock run time, available once the task has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), GridError> {
        if !self.status.can_transition_to(next) {
            return Err(GridError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// PENDING -> RUNNING. Records where the task runs.
    pub fn start(
        &mut self,
        worker_id: impl Into<String>,
        execution_context_id: impl Into<String>,
    ) -> Result<(), GridError> {
        self.transition(TaskStatus::Running)?;
        // Never earlier than creation even if the wall clock stepped back.
        self.started_at = Some(Utc::now().max(self.created_at));
        self.worker_id = Some(worker_id.into());
        self.execution_context_id = Some(execution_context_id.into());
        Ok(())
    }

    /// RUNNING -> COMPLETED with the handler's return value.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), GridError> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.stamp_completed();
        Ok(())
    }

    /// RUNNING -> FAILED with an error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), GridError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.stamp_completed();
        Ok(())
    }

    /// PENDING -> CANCELLED. No timestamps are set since the task never ran.
    pub fn cancel(&mut self) -> Result<(), GridError> {
        self.transition(TaskStatus::Cancelled)
    }

    fn stamp_completed(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(match self.started_at {
            Some(started) => now.max(started),
            None => now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new("scan", Payload::new(), Priority::Normal, 0)
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::Critical.ordinal(), 1);
        assert_eq!(Priority::Low.ordinal(), 4);
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(" Low ".parse::<Priority>().unwrap(), Priority::Low);
        assert!(matches!(
            "URGENT".parse::<Priority>(),
            Err(GridError::InvalidPriority(p)) if p == "URGENT"
        ));
    }

    #[test]
    fn priority_serializes_as_name() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"HIGH\"");
        assert_eq!(
            serde_json::to_string(&TaskStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn task_id_round_trips_through_string() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn request_priority_defaults_to_normal() {
        let req: TaskRequest =
            serde_json::from_value(json!({"task_type": "threat_scan"})).unwrap();
        assert_eq!(req.priority().unwrap(), Priority::Normal);
        assert!(req.payload.is_empty());

        let req = req.with_priority("bogus");
        assert!(req.priority().is_err());
    }

    #[test]
    fn new_task_is_pending() {
        let t = task();
        assert_eq!(t.status(), TaskStatus::Pending);
        assert!(t.started_at().is_none());
        assert!(t.worker_id().is_none());
        assert!(t.duration().is_none());
    }

    #[test]
    fn run_then_complete() {
        let mut t = task();
        t.start("scan_1", "scan_1/slot-0").unwrap();
        assert_eq!(t.status(), TaskStatus::Running);
        assert_eq!(t.worker_id(), Some("scan_1"));
        assert!(t.started_at().is_some());

        t.complete(json!({"threats_found": 0})).unwrap();
        assert_eq!(t.status(), TaskStatus::Completed);
        assert!(t.completed_at().unwrap() >= t.started_at().unwrap());
        assert!(t.error().is_none());
        assert_eq!(t.result().unwrap()["threats_found"], 0);
    }

    #[test]
    fn run_then_fail_keeps_result_empty() {
        let mut t = task();
        t.start("scan_1", "scan_1/slot-0").unwrap();
        t.fail("boom").unwrap();
        assert_eq!(t.status(), TaskStatus::Failed);
        assert_eq!(t.error(), Some("boom"));
        assert!(t.result().is_none());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut t = task();
        assert!(t.complete(json!(null)).is_err());
        assert!(t.fail("nope").is_err());

        t.start("w", "w/slot-0").unwrap();
        assert!(t.cancel().is_err());
        assert!(t.start("w", "w/slot-1").is_err());

        t.complete(json!(1)).unwrap();
        assert!(t.fail("late").is_err());
        assert_eq!(t.status(), TaskStatus::Completed);
    }

    #[test]
    fn cancel_only_from_pending() {
        let mut t = task();
        t.cancel().unwrap();
        assert_eq!(t.status(), TaskStatus::Cancelled);
        assert!(t.status().is_terminal());
        assert!(t.start("w", "w/slot-0").is_err());
    }

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        let all = [Pending, Running, Completed, Failed, Cancelled];
        let allowed = [
            (Pending, Running),
            (Pending, Cancelled),
            (Running, Completed),
            (Running, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }
}
