//! Task registry: task id -> [`Task`], with optional eviction of finished
//! tasks according to a [`RetentionPolicy`].

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use amp_core::{RetentionPolicy, Task, TaskId, TaskStatus};

#[derive(Debug)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Task>,
    /// Finished tasks in completion order, oldest at front.
    finished: VecDeque<(TaskId, DateTime<Utc>)>,
    retention: RetentionPolicy,
    evicted: u64,
}

impl TaskRegistry {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            tasks: HashMap::new(),
            finished: VecDeque::new(),
            retention,
            evicted: 0,
        }
    }

    pub fn insert(&mut self, task: Task) {
        self.tasks.insert(task.id(), task);
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Total tasks dropped by the retention policy so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status() == status).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Record that `id` reached a terminal state. Applies `MaxFinished`
    /// immediately; `Ttl` is applied by [`TaskRegistry::sweep_expired`].
    pub fn mark_finished(&mut self, id: TaskId, at: DateTime<Utc>) {
        if self.retention == RetentionPolicy::Unbounded {
            return;
        }
        self.finished.push_back((id, at));
        if let RetentionPolicy::MaxFinished { limit } = self.retention {
            while self.finished.len() > limit {
                self.evict_front();
            }
        }
    }

    /// Drop finished tasks older than the TTL. Returns how many were evicted.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let RetentionPolicy::Ttl { secs } = self.retention else {
            return 0;
        };
        let ttl_secs = i64::try_from(secs).unwrap_or(i64::MAX);
        let mut removed = 0;
        while let Some(&(_, at)) = self.finished.front() {
            if (now - at).num_seconds() < ttl_secs {
                break;
            }
            self.evict_front();
            removed += 1;
        }
        removed
    }

    fn evict_front(&mut self) {
        if let Some((id, _)) = self.finished.pop_front() {
            // Only terminal tasks are ever pushed onto `finished`.
            if self.tasks.remove(&id).is_some() {
                self.evicted += 1;
            }
        }
    }
}
