//! `VirtualClock` implementation for virtual time control.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::sleep::Sleep;
use super::task_set::{Task, TaskHandle, TaskSet};
use super::Scheduler;

/// A virtual clock that runs scheduled tasks only when explicitly advanced.
///
/// Time-driven sources schedule their work on the clock; a test then moves
/// time forward with [`advance`](Self::advance) and every task that became
/// due runs synchronously on the advancing thread. Two days of simulated
/// delay therefore cost no real waiting.
///
/// # Thread Safety
///
/// `VirtualClock` is thread-safe and can be cloned and shared across threads.
/// All clones share the same time and the same task set.
///
/// # Example
///
/// ```rust
/// use stepverify::clock::{Scheduler, VirtualClock};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = VirtualClock::new();
/// let fired = Arc::new(AtomicBool::new(false));
///
/// let flag = Arc::clone(&fired);
/// clock.schedule_after(Duration::from_secs(60), Box::new(move || {
///     flag.store(true, Ordering::SeqCst);
/// }));
///
/// clock.advance(Duration::from_secs(59));
/// assert!(!fired.load(Ordering::SeqCst));
///
/// clock.advance(Duration::from_secs(1));
/// assert!(fired.load(Ordering::SeqCst));
/// assert_eq!(clock.now(), Duration::from_secs(60));
/// ```
#[derive(Clone)]
pub struct VirtualClock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    /// Current virtual time
    now: Mutex<Duration>,
    /// Pending tasks
    tasks: Arc<Mutex<TaskSet>>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    /// Creates a new `VirtualClock` starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_start_time(Duration::ZERO)
    }

    /// Creates a new `VirtualClock` starting at the specified time.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stepverify::clock::VirtualClock;
    /// use std::time::Duration;
    ///
    /// let clock = VirtualClock::with_start_time(Duration::from_secs(100));
    /// assert_eq!(clock.now(), Duration::from_secs(100));
    /// ```
    #[must_use]
    pub fn with_start_time(start: Duration) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                now: Mutex::new(start),
                tasks: Arc::new(Mutex::new(TaskSet::new())),
            }),
        }
    }

    /// Returns the current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        *self.inner.now.lock()
    }

    /// Advances the clock by `duration` and runs every task that became due.
    ///
    /// The new time is set first; tasks then run one at a time in
    /// `(deadline, insertion order)` order. A task scheduled by a running task
    /// also runs during this call if its deadline is not later than the new
    /// time, so a fixed-rate periodic task fires once per period. Tasks run
    /// without any clock lock held and may schedule more work or advance the
    /// clock themselves.
    ///
    /// Returns the number of tasks that ran.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stepverify::clock::VirtualClock;
    /// use std::time::Duration;
    ///
    /// let clock = VirtualClock::new();
    /// clock.advance(Duration::from_secs(10));
    /// clock.advance(Duration::from_millis(500));
    /// assert_eq!(clock.now(), Duration::from_millis(10_500));
    /// ```
    pub fn advance(&self, duration: Duration) -> usize {
        let target = {
            let mut now = self.inner.now.lock();
            *now += duration;
            *now
        };
        self.run_due(target)
    }

    /// Advances the clock to an absolute time and runs due tasks.
    ///
    /// Time never moves backwards: a target at or before the current time
    /// only runs tasks already due.
    pub fn advance_to(&self, time: Duration) -> usize {
        let target = {
            let mut now = self.inner.now.lock();
            if time > *now {
                *now = time;
            }
            *now
        };
        self.run_due(target)
    }

    /// Returns the number of tasks waiting for their deadline.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Returns the deadline of the earliest pending task.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.tasks.lock().next_deadline()
    }

    /// Creates a future that resolves once the clock reaches `now + duration`.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(Arc::new(self.clone()), duration)
    }

    fn run_due(&self, target: Duration) -> usize {
        let mut fired = 0;
        loop {
            // Popped under the lock, run outside it.
            let task = self.inner.tasks.lock().pop_due(target);
            match task {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => break,
            }
        }
        trace!(now = ?target, fired, "virtual clock advanced");
        fired
    }
}

impl Scheduler for VirtualClock {
    fn now(&self) -> Duration {
        VirtualClock::now(self)
    }

    fn schedule_at(&self, deadline: Duration, task: Task) -> TaskHandle {
        let key = self.inner.tasks.lock().insert(deadline, task);
        TaskHandle::new(key, Arc::downgrade(&self.inner.tasks))
    }
}

impl fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.now())
            .field("pending", &self.pending_count())
            .finish()
    }
}
