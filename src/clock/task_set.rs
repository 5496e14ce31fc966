//! Deadline-ordered task storage shared by the schedulers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;

/// A unit of work run when its deadline is reached.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Ordering key: deadline first, then insertion sequence (FIFO on ties).
type TaskKey = (Duration, u64);

/// Tasks ordered by `(deadline, insertion sequence)`.
#[derive(Default)]
pub(crate) struct TaskSet {
    tasks: BTreeMap<TaskKey, Task>,
    next_seq: u64,
}

impl TaskSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores `task` and returns its key.
    pub(crate) fn insert(&mut self, deadline: Duration, task: Task) -> TaskKey {
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.tasks.insert(key, task);
        key
    }

    /// Removes a task that has not run yet.
    pub(crate) fn remove(&mut self, key: TaskKey) -> bool {
        self.tasks.remove(&key).is_some()
    }

    /// Removes and returns the earliest task due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<Task> {
        let key = *self.tasks.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.tasks.remove(&key)
    }

    /// Deadline of the earliest task, if any.
    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Cancel handle for a scheduled task.
///
/// Cancelling before the task ran removes it; cancelling afterwards, or after
/// the scheduler is gone, does nothing.
#[derive(Clone)]
pub struct TaskHandle {
    key: TaskKey,
    tasks: Weak<Mutex<TaskSet>>,
}

impl TaskHandle {
    pub(crate) fn new(key: TaskKey, tasks: Weak<Mutex<TaskSet>>) -> Self {
        Self { key, tasks }
    }

    /// The deadline this task was scheduled for.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.key.0
    }

    /// Cancels the task. Returns `true` if it was removed before running.
    pub fn cancel(&self) -> bool {
        self.tasks
            .upgrade()
            .is_some_and(|tasks| tasks.lock().remove(self.key))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("deadline", &self.key.0)
            .field("seq", &self.key.1)
            .finish()
    }
}
