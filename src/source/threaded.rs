//! Thread-hopping source.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{invalid_request, Downstream};
use crate::protocol::{
    add_demand, consume_demand, BoxError, FusionMode, Publisher, QueueSubscription, Subscriber,
    Subscription,
};

/// Values requested from upstream ahead of downstream demand.
const PREFETCH: u64 = 32;
/// Consumed values after which upstream is asked for more.
const REPLENISH: u64 = PREFETCH - PREFETCH / 4;

/// Re-emits another source's signals from a dedicated thread.
///
/// Upstream is consumed in batches of 32. The subscription grants ASYNC
/// fusion, in which case the worker thread only announces readiness and the
/// subscriber pulls values itself.
pub struct PublishOnThread<P, T> {
    source: Arc<P>,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

/// Creates a [`PublishOnThread`] around `source`.
pub fn publish_on_thread<P, T>(source: P) -> PublishOnThread<P, T>
where
    P: Publisher<T> + 'static,
{
    PublishOnThread {
        source: Arc::new(source),
        name: "stepverify-publish-on".to_string(),
        _marker: PhantomData,
    }
}

impl<P, T> PublishOnThread<P, T> {
    /// Names the worker threads.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<P, T> Publisher<T> for PublishOnThread<P, T>
where
    P: Publisher<T> + 'static,
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let hop = Arc::new(Hop {
            state: Mutex::new(HopState {
                queue: VecDeque::new(),
                terminal: None,
                upstream: None,
                requested: 0,
                consumed: 0,
                arrived: 0,
                announced: 0,
                fused: false,
                cancelled: false,
            }),
            wake: Condvar::new(),
        });
        subscriber.on_subscribe(hop.clone());

        let worker = Worker {
            hop: Arc::clone(&hop),
            downstream: Downstream::new(Arc::clone(&subscriber)),
        };
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run());
        if let Err(error) = spawned {
            hop.cancel();
            subscriber.on_error(Box::new(error));
            return;
        }

        self.source.subscribe(Arc::new(Upstream { hop }));
    }
}

enum Terminal {
    Complete,
    Error(BoxError),
}

struct HopState<T> {
    queue: VecDeque<T>,
    terminal: Option<Terminal>,
    upstream: Option<Arc<dyn Subscription<T>>>,
    requested: u64,
    consumed: u64,
    arrived: u64,
    /// Arrivals already announced to a fused subscriber.
    announced: u64,
    fused: bool,
    cancelled: bool,
}

impl<T> HopState<T> {
    /// Counts one consumed value and returns the upstream to replenish, if due.
    fn consume(&mut self) -> Option<Arc<dyn Subscription<T>>> {
        self.consumed += 1;
        if self.consumed < REPLENISH {
            return None;
        }
        self.consumed = 0;
        self.upstream.clone()
    }
}

struct Hop<T> {
    state: Mutex<HopState<T>>,
    wake: Condvar,
}

impl<T: Send> Subscription<T> for Hop<T> {
    fn request(&self, n: u64) {
        let mut state = self.state.lock();
        if n == 0 {
            state.terminal = Some(Terminal::Error(invalid_request()));
            state.queue.clear();
        } else {
            state.requested = add_demand(state.requested, n);
        }
        self.wake.notify_all();
    }

    fn cancel(&self) {
        let upstream = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.queue.clear();
            state.upstream.take()
        };
        self.wake.notify_all();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    fn as_queue(&self) -> Option<&dyn QueueSubscription<T>> {
        Some(self)
    }
}

impl<T: Send> QueueSubscription<T> for Hop<T> {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.contains(FusionMode::ASYNC) {
            self.state.lock().fused = true;
            FusionMode::ASYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> Result<Option<T>, BoxError> {
        let (value, replenish) = {
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(value) => (Some(value), state.consume()),
                None => (None, None),
            }
        };
        if let Some(upstream) = replenish {
            upstream.request(REPLENISH);
        }
        Ok(value)
    }

    fn size(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn clear(&self) {
        self.state.lock().queue.clear();
    }
}

/// Upstream-facing side of the hop.
struct Upstream<T> {
    hop: Arc<Hop<T>>,
}

impl<T: Send> Subscriber<T> for Upstream<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription<T>>) {
        {
            let mut state = self.hop.state.lock();
            if !state.cancelled {
                state.upstream = Some(Arc::clone(&subscription));
                drop(state);
                subscription.request(PREFETCH);
                return;
            }
        }
        subscription.cancel();
    }

    fn on_next(&self, value: T) {
        let mut state = self.hop.state.lock();
        if state.cancelled || state.terminal.is_some() {
            return;
        }
        state.queue.push_back(value);
        state.arrived += 1;
        self.hop.wake.notify_all();
    }

    fn on_error(&self, error: BoxError) {
        let mut state = self.hop.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Error(error));
        }
        self.hop.wake.notify_all();
    }

    fn on_complete(&self) {
        let mut state = self.hop.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Complete);
        }
        self.hop.wake.notify_all();
    }
}

/// Delivers signals to the subscriber from the worker thread.
struct Worker<T> {
    hop: Arc<Hop<T>>,
    downstream: Downstream<T>,
}

enum Action<T> {
    Next(T, Option<Arc<dyn Subscription<T>>>),
    Ready,
    Finish(Terminal),
    Stop,
}

impl<T: Send> Worker<T> {
    fn run(self) {
        debug!("worker started");
        loop {
            match self.next_action() {
                Action::Next(value, replenish) => {
                    self.downstream.next(value);
                    if let Some(upstream) = replenish {
                        upstream.request(REPLENISH);
                    }
                }
                Action::Ready => self.downstream.queue_ready(),
                Action::Finish(Terminal::Complete) => {
                    self.downstream.complete();
                    break;
                }
                Action::Finish(Terminal::Error(error)) => {
                    self.downstream.error(error);
                    break;
                }
                Action::Stop => break,
            }
        }
        debug!("worker stopped");
    }

    fn next_action(&self) -> Action<T> {
        let mut state = self.hop.state.lock();
        loop {
            if state.cancelled {
                return Action::Stop;
            }
            if state.fused {
                if state.announced != state.arrived {
                    state.announced = state.arrived;
                    return Action::Ready;
                }
                if let Some(terminal) = state.terminal.take() {
                    return Action::Finish(terminal);
                }
            } else {
                if state.requested > 0 {
                    if let Some(value) = state.queue.pop_front() {
                        state.requested = consume_demand(state.requested);
                        let replenish = state.consume();
                        return Action::Next(value, replenish);
                    }
                }
                if state.queue.is_empty() {
                    if let Some(terminal) = state.terminal.take() {
                        return Action::Finish(terminal);
                    }
                }
            }
            self.hop.wake.wait(&mut state);
        }
    }
}
