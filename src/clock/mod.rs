//! Schedulers and virtual time
//!
//! The `clock` module provides the [`Scheduler`] abstraction used by
//! time-driven sources, with two implementations sharing one deadline-ordered
//! task set:
//!
//! - [`VirtualClock`] runs tasks only when a test advances it, so hours of
//!   simulated delay complete instantly.
//! - [`WallClock`] runs tasks on a timer thread as real time passes.
//!
//! Tasks with equal deadlines run in the order they were scheduled.
//!
//! # Example
//!
//! ```rust
//! use stepverify::clock::VirtualClock;
//! use std::time::Duration;
//!
//! let clock = VirtualClock::new();
//! assert_eq!(clock.now(), Duration::ZERO);
//!
//! clock.advance(Duration::from_secs(10));
//! assert_eq!(clock.now(), Duration::from_secs(10));
//! ```

mod sleep;
mod task_set;
mod virtual_clock;
mod wall_clock;

use std::time::Duration;

pub use sleep::Sleep;
pub use task_set::{Task, TaskHandle};
pub use virtual_clock::VirtualClock;
pub use wall_clock::WallClock;

/// A source of time that can run tasks at a deadline.
///
/// Instants are durations since the scheduler's origin.
pub trait Scheduler: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Duration;

    /// Runs `task` once the scheduler reaches `deadline`.
    fn schedule_at(&self, deadline: Duration, task: Task) -> TaskHandle;

    /// Runs `task` once `delay` has passed from [`now`](Self::now).
    fn schedule_after(&self, delay: Duration, task: Task) -> TaskHandle {
        self.schedule_at(self.now() + delay, task)
    }
}
