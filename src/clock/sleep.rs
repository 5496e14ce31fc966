//! Scheduler-driven sleep future.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;

use super::task_set::TaskHandle;
use super::Scheduler;

#[derive(Default)]
struct SleepState {
    fired: bool,
    waker: Option<Waker>,
}

/// A future that completes when its scheduler reaches the deadline.
///
/// The wake-up is registered with the scheduler on first poll. With a
/// [`VirtualClock`](super::VirtualClock) it completes as soon as a test
/// advances time past the deadline; with a [`WallClock`](super::WallClock)
/// after real time has passed. Dropping the future cancels the wake-up.
///
/// Created by [`VirtualClock::sleep`](super::VirtualClock::sleep) and
/// [`WallClock::sleep`](super::WallClock::sleep).
pub struct Sleep {
    scheduler: Arc<dyn Scheduler>,
    deadline: Duration,
    state: Arc<Mutex<SleepState>>,
    handle: Option<TaskHandle>,
}

impl Sleep {
    /// Creates a sleep of `duration` measured on `scheduler`.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>, duration: Duration) -> Self {
        let deadline = scheduler.now() + duration;
        Self {
            scheduler,
            deadline,
            state: Arc::new(Mutex::new(SleepState::default())),
            handle: None,
        }
    }

    /// Returns the deadline for this sleep.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Returns `true` if the scheduler has reached the deadline.
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        self.scheduler.now() >= self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        {
            let mut state = self.state.lock();
            if state.fired || self.scheduler.now() >= self.deadline {
                return Poll::Ready(());
            }
            state.waker = Some(cx.waker().clone());
        }

        if self.handle.is_none() {
            let state = Arc::clone(&self.state);
            let handle = self.scheduler.schedule_at(
                self.deadline,
                Box::new(move || {
                    let waker = {
                        let mut state = state.lock();
                        state.fired = true;
                        state.waker.take()
                    };
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }),
            );
            self.handle = Some(handle);
            // The clock may have passed the deadline before the task was stored.
            if self.scheduler.now() >= self.deadline {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("registered", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::VirtualClock;
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn test_sleep_deadline() {
        let clock = VirtualClock::new();
        clock.advance(Duration::from_secs(5));
        let sleep = clock.sleep(Duration::from_secs(10));

        assert_eq!(sleep.deadline(), Duration::from_secs(15));
        assert!(!sleep.is_elapsed());
        clock.advance(Duration::from_secs(10));
        assert!(sleep.is_elapsed());
    }

    #[test]
    fn test_sleep_registers_on_first_poll() {
        let clock = VirtualClock::new();
        let mut sleep = clock.sleep(Duration::from_secs(10));
        assert_eq!(clock.pending_count(), 0);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert_eq!(clock.pending_count(), 1);

        clock.advance(Duration::from_secs(10));
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_ready());
    }

    #[test]
    fn test_drop_cancels_wakeup() {
        let clock = VirtualClock::new();
        let mut sleep = clock.sleep(Duration::from_secs(10));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = Pin::new(&mut sleep).poll(&mut cx);

        drop(sleep);
        assert_eq!(clock.pending_count(), 0);
    }

    #[test]
    fn test_block_on_with_advancing_thread() {
        let clock = VirtualClock::new();
        let sleep = clock.sleep(Duration::from_secs(3600));

        let advancer = clock.clone();
        let handle = std::thread::spawn(move || {
            while advancer.pending_count() == 0 {
                std::thread::yield_now();
            }
            advancer.advance(Duration::from_secs(3600));
        });

        futures::executor::block_on(sleep);
        handle.join().unwrap();
        assert_eq!(clock.now(), Duration::from_secs(3600));
    }
}
