//! Reference publishers.
//!
//! Small, protocol-compliant sources used to exercise the verifier:
//!
//! | source | behavior |
//! |---|---|
//! | [`from_iter`], [`just`], [`range`], [`empty`] | emit on demand, SYNC-fusable |
//! | [`error`], [`concat_error`] | terminate with an error |
//! | [`never`] | subscribe and stay silent |
//! | [`interval`] | tick on a [`Scheduler`](crate::clock::Scheduler) at a fixed rate |
//! | [`delay_elements`] | emit each value after a delay |
//! | [`delay_subscription`] | subscribe upstream after a delay |
//! | [`publish_on_thread`] | re-emit on a background thread, ASYNC-fusable |
//! | [`from_stream`] | drive a `futures` stream on a background thread |
//! | [`hide`] | strip queue support from another source |
//!
//! Sources built from iterators are cold: every subscription replays them
//! from the start.
//!
//! ```rust
//! use stepverify::source;
//! use stepverify::verifier::StepVerifier;
//!
//! StepVerifier::create_with_request(source::range(1, 3), 0)
//!     .then_request(2)
//!     .expect_next_values([1, 2])
//!     .then_request(1)
//!     .expect_next(3)
//!     .expect_complete()
//!     .verify();
//! ```

mod hide;
mod iter;
mod stream;
mod threaded;
mod timed;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{add_demand, BoxError, Subscriber, UNBOUNDED};

pub use hide::{hide, Hide};
pub use iter::{concat_error, empty, error, from_iter, just, never, range, FromIter, Never};
pub use stream::{from_stream, FromStream};
pub use threaded::{publish_on_thread, PublishOnThread};
pub use timed::{delay_elements, delay_subscription, interval, DelayElements, DelaySubscription, Interval};

/// Outstanding demand shared between a subscription and its emitter.
#[derive(Debug, Default)]
pub(crate) struct Demand(AtomicU64);

impl Demand {
    /// Adds `n` and returns the previous value.
    pub(crate) fn add(&self, n: u64) -> u64 {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(add_demand(current, n))
            })
            .unwrap_or_else(|current| current)
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Takes one unit of demand if there is any.
    pub(crate) fn take_one(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
                0 => None,
                UNBOUNDED => Some(UNBOUNDED),
                n => Some(n - 1),
            })
            .is_ok()
    }

    /// Removes `emitted` units and returns what is left.
    pub(crate) fn produced(&self, emitted: u64) -> u64 {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED {
                    Some(UNBOUNDED)
                } else {
                    Some(current.saturating_sub(emitted))
                }
            })
            .unwrap_or(0);
        if previous == UNBOUNDED {
            UNBOUNDED
        } else {
            previous.saturating_sub(emitted)
        }
    }
}

/// The subscriber side of a subscription. It is released on the first
/// terminal signal or on cancel; anything emitted afterwards goes nowhere.
pub(crate) struct Downstream<T> {
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
}

impl<T> Downstream<T> {
    pub(crate) fn new(subscriber: Arc<dyn Subscriber<T>>) -> Self {
        Self {
            subscriber: Mutex::new(Some(subscriber)),
        }
    }

    fn current(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.subscriber.lock().clone()
    }

    pub(crate) fn release(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.subscriber.lock().take()
    }

    pub(crate) fn next(&self, value: T) {
        if let Some(subscriber) = self.current() {
            subscriber.on_next(value);
        }
    }

    pub(crate) fn queue_ready(&self) {
        if let Some(subscriber) = self.current() {
            subscriber.on_queue_ready();
        }
    }

    pub(crate) fn complete(&self) {
        if let Some(subscriber) = self.release() {
            subscriber.on_complete();
        }
    }

    pub(crate) fn error(&self, error: BoxError) {
        if let Some(subscriber) = self.release() {
            subscriber.on_error(error);
        }
    }
}

/// Error raised when a subscriber requests a non-positive amount.
pub(crate) fn invalid_request() -> BoxError {
    "request amount must be positive, got 0".into()
}
