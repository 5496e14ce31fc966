//! Scheduler-driven sources.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{invalid_request, Demand, Downstream};
use crate::clock::{Scheduler, TaskHandle};
use crate::protocol::{
    add_demand, consume_demand, BoxError, Publisher, Subscriber, Subscription,
};

/// Emits `0, 1, 2, ...` every `period` on a scheduler.
///
/// Ticks are scheduled at fixed rate from the subscription time. A tick that
/// finds no demand fails the subscription.
pub struct Interval {
    scheduler: Arc<dyn Scheduler>,
    period: Duration,
}

/// Creates an [`Interval`] ticking every `period` on `scheduler`.
pub fn interval<S>(scheduler: S, period: Duration) -> Interval
where
    S: Scheduler + 'static,
{
    Interval {
        scheduler: Arc::new(scheduler),
        period,
    }
}

impl Publisher<u64> for Interval {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<u64>>) {
        let ticker = Arc::new(Ticker {
            scheduler: Arc::clone(&self.scheduler),
            period: self.period,
            downstream: Downstream::new(Arc::clone(&subscriber)),
            demand: Demand::default(),
            count: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            handle: Mutex::new(None),
        });
        subscriber.on_subscribe(ticker.clone());
        let first = self.scheduler.now() + self.period;
        ticker.schedule(first);
    }
}

struct Ticker {
    scheduler: Arc<dyn Scheduler>,
    period: Duration,
    downstream: Downstream<u64>,
    demand: Demand,
    count: AtomicU64,
    cancelled: AtomicBool,
    handle: Mutex<Option<TaskHandle>>,
}

impl Ticker {
    fn schedule(self: &Arc<Self>, deadline: Duration) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let ticker = Arc::clone(self);
        let handle = self
            .scheduler
            .schedule_at(deadline, Box::new(move || ticker.tick(deadline)));
        *self.handle.lock() = Some(handle);
    }

    fn tick(self: &Arc<Self>, deadline: Duration) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let n = self.count.fetch_add(1, Ordering::AcqRel);
        if !self.demand.take_one() {
            self.cancelled.store(true, Ordering::Release);
            self.downstream.error(
                format!("could not emit tick {n} due to lack of requests").into(),
            );
            return;
        }
        trace!(tick = n, ?deadline, "interval tick");
        self.downstream.next(n);
        self.schedule(deadline + self.period);
    }
}

impl Subscription<u64> for Ticker {
    fn request(&self, n: u64) {
        if n == 0 {
            self.cancel();
            self.downstream.error(invalid_request());
            return;
        }
        self.demand.add(n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.downstream.release();
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
    }
}

/// Emits each value of an iterable `delay` after the previous one, then
/// completes right after the last.
///
/// The delay for a value starts once there is demand for it.
pub struct DelayElements<I> {
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    items: I,
}

/// Creates a [`DelayElements`] source.
pub fn delay_elements<S, I>(scheduler: S, delay: Duration, items: I) -> DelayElements<I>
where
    S: Scheduler + 'static,
    I: IntoIterator + Clone,
{
    DelayElements {
        scheduler: Arc::new(scheduler),
        delay,
        items,
    }
}

impl<I> Publisher<I::Item> for DelayElements<I>
where
    I: IntoIterator + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<I::Item>>) {
        let mut iter = self.items.clone().into_iter();
        let first = iter.next();
        let emitter = Arc::new_cyclic(|me| Delayed {
            me: me.clone(),
            scheduler: Arc::clone(&self.scheduler),
            delay: self.delay,
            downstream: Downstream::new(Arc::clone(&subscriber)),
            state: Mutex::new(DelayedState {
                iter,
                upcoming: first,
                demand: 0,
                timer: None,
                cancelled: false,
            }),
        });
        subscriber.on_subscribe(emitter.clone());

        let empty = emitter.state.lock().upcoming.is_none();
        if empty {
            emitter.downstream.complete();
        }
    }
}

struct DelayedState<I: Iterator> {
    iter: I,
    upcoming: Option<I::Item>,
    demand: u64,
    timer: Option<TaskHandle>,
    cancelled: bool,
}

struct Delayed<I: Iterator> {
    me: Weak<Delayed<I>>,
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    downstream: Downstream<I::Item>,
    state: Mutex<DelayedState<I>>,
}

impl<I> Delayed<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    /// Starts the timer for the upcoming value. Called with the lock held.
    fn arm(&self, state: &mut DelayedState<I>) {
        if state.cancelled || state.timer.is_some() || state.upcoming.is_none() || state.demand == 0 {
            return;
        }
        let Some(emitter) = self.me.upgrade() else {
            return;
        };
        state.timer = Some(
            self.scheduler
                .schedule_after(self.delay, Box::new(move || emitter.fire())),
        );
    }

    fn fire(&self) {
        let (value, last) = {
            let mut state = self.state.lock();
            state.timer = None;
            if state.cancelled {
                return;
            }
            let Some(value) = state.upcoming.take() else {
                return;
            };
            state.demand = consume_demand(state.demand);
            state.upcoming = state.iter.next();
            (value, state.upcoming.is_none())
        };

        self.downstream.next(value);
        if last {
            self.downstream.complete();
            return;
        }
        let mut state = self.state.lock();
        self.arm(&mut state);
    }
}

impl<I> Subscription<I::Item> for Delayed<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.cancel();
            self.downstream.error(invalid_request());
            return;
        }
        let mut state = self.state.lock();
        state.demand = add_demand(state.demand, n);
        self.arm(&mut state);
    }

    fn cancel(&self) {
        let timer = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.downstream.release();
    }
}

/// Subscribes to another source only after `delay` has passed.
///
/// The subscriber receives its subscription immediately; demand and cancel
/// issued before the upstream subscription exists are replayed to it.
pub struct DelaySubscription<P, T> {
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    source: Arc<P>,
    _marker: PhantomData<fn() -> T>,
}

/// Creates a [`DelaySubscription`] around `source`.
pub fn delay_subscription<S, P, T>(scheduler: S, delay: Duration, source: P) -> DelaySubscription<P, T>
where
    S: Scheduler + 'static,
    P: Publisher<T> + 'static,
{
    DelaySubscription {
        scheduler: Arc::new(scheduler),
        delay,
        source: Arc::new(source),
        _marker: PhantomData,
    }
}

impl<P, T> Publisher<T> for DelaySubscription<P, T>
where
    P: Publisher<T> + 'static,
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let arbiter = Arc::new(Arbiter {
            state: Mutex::new(ArbiterState {
                upstream: None,
                pending: 0,
                cancelled: false,
                timer: None,
            }),
        });
        subscriber.on_subscribe(arbiter.clone());

        let source = Arc::clone(&self.source);
        let relay: Arc<dyn Subscriber<T>> = Arc::new(Relay {
            downstream: subscriber,
            arbiter: Arc::clone(&arbiter),
        });
        let timer = self.scheduler.schedule_after(
            self.delay,
            Box::new(move || source.subscribe(relay)),
        );

        let mut state = arbiter.state.lock();
        if state.cancelled {
            drop(state);
            timer.cancel();
        } else {
            state.timer = Some(timer);
        }
    }
}

struct ArbiterState<T> {
    upstream: Option<Arc<dyn Subscription<T>>>,
    pending: u64,
    cancelled: bool,
    timer: Option<TaskHandle>,
}

struct Arbiter<T> {
    state: Mutex<ArbiterState<T>>,
}

impl<T> Arbiter<T> {
    fn set_upstream(&self, upstream: Arc<dyn Subscription<T>>) {
        let pending = {
            let mut state = self.state.lock();
            if state.cancelled {
                None
            } else {
                state.upstream = Some(Arc::clone(&upstream));
                state.timer = None;
                Some(std::mem::take(&mut state.pending))
            }
        };
        match pending {
            None => upstream.cancel(),
            Some(0) => {}
            Some(n) => upstream.request(n),
        }
    }
}

impl<T: Send> Subscription<T> for Arbiter<T> {
    fn request(&self, n: u64) {
        let upstream = {
            let mut state = self.state.lock();
            match &state.upstream {
                Some(upstream) => Some(Arc::clone(upstream)),
                None => {
                    state.pending = add_demand(state.pending, n);
                    None
                }
            }
        };
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        let (upstream, timer) = {
            let mut state = self.state.lock();
            state.cancelled = true;
            (state.upstream.take(), state.timer.take())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct Relay<T> {
    downstream: Arc<dyn Subscriber<T>>,
    arbiter: Arc<Arbiter<T>>,
}

impl<T: Send> Subscriber<T> for Relay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription<T>>) {
        self.arbiter.set_upstream(subscription);
    }

    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: BoxError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::protocol::UNBOUNDED;
    use crate::source::{just, testing::Collect};

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_interval_ticks_at_fixed_rate() {
        let clock = VirtualClock::new();
        let collect = Arc::new(Collect::<u64>::default());
        interval(clock.clone(), Duration::from_secs(1)).subscribe(collect.clone());
        collect.request(UNBOUNDED);

        clock.advance(Duration::from_millis(2500));
        assert_eq!(collect.events(), vec!["0", "1"]);

        clock.advance(Duration::from_millis(500));
        assert_eq!(collect.events(), vec!["0", "1", "2"]);

        collect.cancel();
        assert_eq!(clock.pending_count(), 0);
    }

    #[test]
    fn test_interval_without_demand_fails() {
        let clock = VirtualClock::new();
        let collect = Arc::new(Collect::<u64>::default());
        interval(clock.clone(), Duration::from_secs(1)).subscribe(collect.clone());
        collect.request(1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(
            collect.events(),
            vec!["0", "error: could not emit tick 1 due to lack of requests"]
        );
    }

    #[test]
    fn test_delay_elements_waits_between_values() {
        let clock = VirtualClock::new();
        let collect = Arc::new(Collect::<u64>::default());
        delay_elements(clock.clone(), HOUR, vec![1_u64, 2, 3]).subscribe(collect.clone());
        collect.request(UNBOUNDED);

        clock.advance(HOUR - Duration::from_secs(1));
        assert!(collect.events().is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(collect.events(), vec!["1"]);

        clock.advance(HOUR * 2);
        assert_eq!(collect.events(), vec!["1", "2", "3", "complete"]);
    }

    #[test]
    fn test_delay_elements_holds_timer_until_demand() {
        let clock = VirtualClock::new();
        let collect = Arc::new(Collect::<u64>::default());
        delay_elements(clock.clone(), HOUR, vec![1_u64, 2]).subscribe(collect.clone());

        clock.advance(HOUR * 5);
        assert!(collect.events().is_empty());
        assert_eq!(clock.pending_count(), 0);

        collect.request(1);
        clock.advance(HOUR);
        assert_eq!(collect.events(), vec!["1"]);
        assert_eq!(clock.pending_count(), 0);
    }

    #[test]
    fn test_delay_subscription_replays_demand() {
        let clock = VirtualClock::new();
        let collect = Arc::new(Collect::<u64>::default());
        delay_subscription(clock.clone(), HOUR, just([5_u64, 6])).subscribe(collect.clone());
        collect.request(1);

        assert!(collect.events().is_empty());
        clock.advance(HOUR);
        assert_eq!(collect.events(), vec!["5"]);

        collect.request(1);
        assert_eq!(collect.events(), vec!["5", "6", "complete"]);
    }

    #[test]
    fn test_delay_subscription_cancelled_before_subscribe() {
        let clock = VirtualClock::new();
        let collect = Arc::new(Collect::<u64>::default());
        delay_subscription(clock.clone(), HOUR, just([5_u64])).subscribe(collect.clone());
        collect.request(UNBOUNDED);
        collect.cancel();

        assert_eq!(clock.pending_count(), 0);
        clock.advance(HOUR);
        assert!(collect.events().is_empty());
    }
}
