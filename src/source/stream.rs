//! Adapter from `futures` streams.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

use futures_core::Stream;
use parking_lot::Mutex;
use pin_project_lite::pin_project;

use super::{invalid_request, Downstream};
use crate::protocol::{add_demand, consume_demand, Publisher, Subscriber, Subscription};

/// Drives a stream on a background thread, pulling one item per unit of
/// demand.
///
/// The stream is created by a factory so each subscription starts afresh.
/// The stream ending completes the subscriber; `Err` items are ordinary
/// values.
pub struct FromStream<F, S> {
    factory: Arc<F>,
    _marker: PhantomData<fn() -> S>,
}

/// Creates a [`FromStream`] source from a stream factory.
pub fn from_stream<F, S>(factory: F) -> FromStream<F, S>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream + Send + 'static,
{
    FromStream {
        factory: Arc::new(factory),
        _marker: PhantomData,
    }
}

impl<F, S> Publisher<S::Item> for FromStream<F, S>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<S::Item>>) {
        let gate = Arc::new(Gate {
            state: Mutex::new(GateState {
                demand: 0,
                cancelled: false,
                invalid: false,
                waker: None,
            }),
        });
        subscriber.on_subscribe(gate.clone());

        let factory = Arc::clone(&self.factory);
        let pump_gate = Arc::clone(&gate);
        let downstream = Downstream::new(Arc::clone(&subscriber));
        let spawned = thread::Builder::new()
            .name("stepverify-stream".to_string())
            .spawn(move || {
                futures::executor::block_on(Pump {
                    stream: factory(),
                    gate: pump_gate,
                    downstream,
                });
            });
        if let Err(error) = spawned {
            Subscription::<S::Item>::cancel(&*gate);
            subscriber.on_error(Box::new(error));
        }
    }
}

struct GateState {
    demand: u64,
    cancelled: bool,
    invalid: bool,
    waker: Option<Waker>,
}

struct Gate {
    state: Mutex<GateState>,
}

impl GateState {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

impl<T> Subscription<T> for Gate {
    fn request(&self, n: u64) {
        let mut state = self.state.lock();
        if n == 0 {
            state.invalid = true;
        } else {
            state.demand = add_demand(state.demand, n);
        }
        state.wake();
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.wake();
    }
}

pin_project! {
    /// Polls the stream whenever the gate holds demand.
    struct Pump<S: Stream> {
        #[pin]
        stream: S,
        gate: Arc<Gate>,
        downstream: Downstream<S::Item>,
    }
}

enum Admission {
    Pull,
    Wait,
    Stop,
    Invalid,
}

impl<S: Stream> Future for Pump<S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut this = self.project();
        loop {
            let admission = {
                let mut state = this.gate.state.lock();
                if state.cancelled {
                    Admission::Stop
                } else if state.invalid {
                    Admission::Invalid
                } else if state.demand == 0 {
                    state.waker = Some(cx.waker().clone());
                    Admission::Wait
                } else {
                    Admission::Pull
                }
            };
            match admission {
                Admission::Stop => return Poll::Ready(()),
                Admission::Invalid => {
                    this.downstream.error(invalid_request());
                    return Poll::Ready(());
                }
                Admission::Wait => return Poll::Pending,
                Admission::Pull => {}
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    {
                        let mut state = this.gate.state.lock();
                        state.demand = consume_demand(state.demand);
                    }
                    this.downstream.next(item);
                }
                Poll::Ready(None) => {
                    this.downstream.complete();
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
