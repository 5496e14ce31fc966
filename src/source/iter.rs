//! Iterator-backed sources.

use std::iter::{self, Empty, Peekable};
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{invalid_request, Demand, Downstream};
use crate::protocol::{
    BoxError, FusionMode, Publisher, QueueSubscription, Subscriber, Subscription, UNBOUNDED,
};

type ErrorFactory = Arc<dyn Fn() -> BoxError + Send + Sync>;

/// Emits the items of an iterable on demand, then completes or fails.
///
/// The iterable is cloned for every subscription. Its subscriptions support
/// SYNC fusion.
pub struct FromIter<I> {
    items: I,
    error: Option<ErrorFactory>,
}

/// Creates a source emitting the items of `items`.
pub fn from_iter<I>(items: I) -> FromIter<I>
where
    I: IntoIterator + Clone,
{
    FromIter { items, error: None }
}

/// Creates a source emitting `values`.
pub fn just<T, I>(values: I) -> FromIter<Vec<T>>
where
    T: Clone,
    I: IntoIterator<Item = T>,
{
    from_iter(values.into_iter().collect())
}

/// Creates a source emitting `count` integers starting at `start`.
#[must_use]
pub fn range(start: u64, count: u64) -> FromIter<Range<u64>> {
    from_iter(start..start.saturating_add(count))
}

/// Creates a source that completes immediately.
#[must_use]
pub fn empty<T>() -> FromIter<Empty<T>> {
    from_iter(iter::empty())
}

/// Creates a source that fails immediately with `error`.
pub fn error<T, E>(error: E) -> FromIter<Empty<T>>
where
    E: Into<BoxError> + Clone + Send + Sync + 'static,
{
    concat_error(iter::empty(), error)
}

/// Creates a source emitting `items` and then failing with `error`.
pub fn concat_error<I, E>(items: I, error: E) -> FromIter<I>
where
    I: IntoIterator + Clone,
    E: Into<BoxError> + Clone + Send + Sync + 'static,
{
    FromIter {
        items,
        error: Some(Arc::new(move || error.clone().into())),
    }
}

impl<I> Publisher<I::Item> for FromIter<I>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<I::Item>>) {
        let subscription = Arc::new(IterSubscription {
            iter: Mutex::new(self.items.clone().into_iter().peekable()),
            error: self.error.clone(),
            downstream: Downstream::new(Arc::clone(&subscriber)),
            demand: Demand::default(),
            cancelled: AtomicBool::new(false),
            fused: AtomicBool::new(false),
            polled_out: AtomicBool::new(false),
        });
        subscriber.on_subscribe(subscription.clone());
        subscription.finish_if_exhausted();
    }
}

struct IterSubscription<I: Iterator> {
    iter: Mutex<Peekable<I>>,
    error: Option<ErrorFactory>,
    downstream: Downstream<I::Item>,
    demand: Demand,
    cancelled: AtomicBool,
    fused: AtomicBool,
    polled_out: AtomicBool,
}

impl<I: Iterator> IterSubscription<I> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_exhausted(&self) -> bool {
        self.iter.lock().peek().is_none()
    }

    fn finish(&self) {
        match &self.error {
            Some(error) => self.downstream.error(error()),
            None => self.downstream.complete(),
        }
    }

    fn finish_if_exhausted(&self) {
        if !self.fused.load(Ordering::Acquire) && !self.is_cancelled() && self.is_exhausted() {
            self.finish();
        }
    }

    /// Emits while there is demand. Only the caller that raised demand from
    /// zero runs this loop; later requests just add to the counter.
    fn drain(&self) {
        let mut emitted = 0;
        let mut requested = self.demand.get();
        loop {
            while requested == UNBOUNDED || emitted != requested {
                if self.is_cancelled() {
                    return;
                }
                let next = self.iter.lock().next();
                let Some(value) = next else {
                    return self.finish();
                };
                self.downstream.next(value);
                emitted += 1;

                if self.is_cancelled() {
                    return;
                }
                if self.is_exhausted() {
                    return self.finish();
                }
            }

            requested = self.demand.produced(emitted);
            if requested == 0 {
                return;
            }
            emitted = 0;
        }
    }
}

impl<I> Subscription<I::Item> for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.cancelled.store(true, Ordering::Release);
            self.downstream.error(invalid_request());
            return;
        }
        if self.demand.add(n) == 0 {
            self.drain();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.downstream.release();
    }

    fn as_queue(&self) -> Option<&dyn QueueSubscription<I::Item>> {
        Some(self)
    }
}

impl<I> QueueSubscription<I::Item> for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.contains(FusionMode::SYNC) {
            self.fused.store(true, Ordering::Release);
            FusionMode::SYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> Result<Option<I::Item>, BoxError> {
        if self.is_cancelled() {
            return Ok(None);
        }
        let next = self.iter.lock().next();
        if next.is_some() {
            return Ok(next);
        }
        self.downstream.release();
        match &self.error {
            Some(error) if !self.polled_out.swap(true, Ordering::AcqRel) => Err(error()),
            _ => Ok(None),
        }
    }

    fn size(&self) -> usize {
        let mut iter = self.iter.lock();
        if iter.peek().is_none() {
            0
        } else {
            iter.size_hint().0.max(1)
        }
    }

    fn clear(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// A source that never signals anything after the subscription.
pub struct Never<T> {
    _marker: PhantomData<fn() -> T>,
}

/// Creates a source that subscribes and then stays silent.
#[must_use]
pub fn never<T>() -> Never<T> {
    Never {
        _marker: PhantomData,
    }
}

struct Silent;

impl<T> Subscription<T> for Silent {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

impl<T> Publisher<T> for Never<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Arc::new(Silent));
    }
}
