//! Real-time scheduler backed by a single timer thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::sleep::Sleep;
use super::task_set::{Task, TaskHandle, TaskSet};
use super::Scheduler;

/// A [`Scheduler`] that runs tasks when real time reaches their deadline.
///
/// Deadlines are measured from the moment the clock was created. All tasks run
/// one after another on a dedicated timer thread, which stops when the last
/// clone of the clock is dropped.
///
/// # Example
///
/// ```rust
/// use stepverify::clock::{Scheduler, WallClock};
/// use std::sync::mpsc;
/// use std::time::Duration;
///
/// let clock = WallClock::new();
/// let (tx, rx) = mpsc::channel();
/// clock.schedule_after(Duration::from_millis(10), Box::new(move || {
///     tx.send("tick").unwrap();
/// }));
/// assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "tick");
/// ```
#[derive(Clone)]
pub struct WallClock {
    inner: Arc<WallHandle>,
}

/// Owned by user-facing clones; stops the timer thread on drop.
struct WallHandle {
    timer: Arc<Timer>,
}

struct Timer {
    origin: Instant,
    tasks: Arc<Mutex<TaskSet>>,
    wakeup: Condvar,
    stopped: AtomicBool,
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock {
    /// Creates a clock and starts its timer thread.
    #[must_use]
    pub fn new() -> Self {
        let timer = Arc::new(Timer {
            origin: Instant::now(),
            tasks: Arc::new(Mutex::new(TaskSet::new())),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let worker = Arc::clone(&timer);
        thread::spawn(move || worker.run());
        Self {
            inner: Arc::new(WallHandle { timer }),
        }
    }

    /// Returns the real time elapsed since the clock was created.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.timer.origin.elapsed()
    }

    /// Returns the number of tasks waiting for their deadline.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.timer.tasks.lock().len()
    }

    /// Creates a future that resolves after `duration` of real time.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(Arc::new(self.clone()), duration)
    }
}

impl Timer {
    fn run(&self) {
        let mut tasks = self.tasks.lock();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            let now = self.origin.elapsed();
            if let Some(task) = tasks.pop_due(now) {
                drop(tasks);
                task();
                tasks = self.tasks.lock();
                continue;
            }
            match tasks.next_deadline() {
                Some(deadline) => {
                    let _ = self.wakeup.wait_for(&mut tasks, deadline - now);
                }
                None => self.wakeup.wait(&mut tasks),
            }
        }
    }
}

impl Drop for WallHandle {
    fn drop(&mut self) {
        self.timer.stopped.store(true, Ordering::Release);
        let _guard = self.timer.tasks.lock();
        self.timer.wakeup.notify_all();
        trace!("wall clock timer stopped");
    }
}

impl Scheduler for WallClock {
    fn now(&self) -> Duration {
        WallClock::now(self)
    }

    fn schedule_at(&self, deadline: Duration, task: Task) -> TaskHandle {
        let timer = &self.inner.timer;
        let key = {
            let mut tasks = timer.tasks.lock();
            let key = tasks.insert(deadline, task);
            timer.wakeup.notify_all();
            key
        };
        TaskHandle::new(key, Arc::downgrade(&timer.tasks))
    }
}

impl fmt::Debug for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WallClock")
            .field("now", &self.now())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let clock = WallClock::new();
        let (tx, rx) = mpsc::channel();

        for (delay, label) in [(40, "c"), (10, "a"), (20, "b")] {
            let tx = tx.clone();
            clock.schedule_after(
                Duration::from_millis(delay),
                Box::new(move || tx.send(label).unwrap()),
            );
        }

        let got: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_task_does_not_fire_early() {
        let clock = WallClock::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        clock.schedule_after(
            Duration::from_millis(50),
            Box::new(move || tx.send(()).unwrap()),
        );

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_cancel_before_deadline() {
        let clock = WallClock::new();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = clock.schedule_after(
            Duration::from_millis(50),
            Box::new(move || tx.send(()).unwrap()),
        );
        assert!(handle.cancel());
        assert_eq!(clock.pending_count(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }
}
