//! Priority-ordered pending queue.
//!
//! Entries are ordered by `(priority, sequence)`: priority ordinal first,
//! then submission sequence so equal priorities are served FIFO. Because the
//! key is stable, putting an entry back restores its exact position.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use amp_core::{Priority, Task, TaskId};

/// A pending task as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub priority: Priority,
    pub sequence: u64,
    pub task_id: TaskId,
    pub task_type: String,
}

impl QueueEntry {
    pub fn for_task(task: &Task) -> Self {
        Self {
            priority: task.priority(),
            sequence: task.sequence(),
            task_id: task.id(),
            task_type: task.task_type().to_string(),
        }
    }

    fn key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }
}

// Sequence numbers are unique per grid, so the key alone identifies an entry.
impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: BTreeSet<QueueEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.insert(entry);
    }

    /// Remove and return the best entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_first()
    }

    #[cfg(test)]
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.first()
    }

    /// Remove a specific entry. Returns false if it was not queued.
    pub fn remove(&mut self, entry: &QueueEntry) -> bool {
        self.entries.remove(entry)
    }

    #[cfg(test)]
    pub fn contains(&self, entry: &QueueEntry) -> bool {
        self.entries.contains(entry)
    }

    /// Entries in dispatch order.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending count per priority level.
    /// Every level is present, zero when nothing is queued at it.
    pub fn depth_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut depth: BTreeMap<Priority, usize> = Priority::ALL.iter().map(|&p| (p, 0)).collect();
        for entry in &self.entries {
            *depth.entry(entry.priority).or_default() += 1;
        }
        depth
    }
}
