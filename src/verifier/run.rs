//! The run controller: subscribes the engine and drives the program on the
//! calling thread until a verdict is reached.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::engine::{Engine, Work};
use super::step::{guarded, Step, StepKind};
use crate::clock::VirtualClock;
use crate::error::{Error, Result};
use crate::protocol::{Publisher, Subscriber};

impl<T: Debug + Send + Sync + 'static> Engine<T> {
    /// Subscribes to `publisher` and blocks until the run is decided.
    ///
    /// `then_await` steps advance `clock` when one is bound and sleep on the
    /// wall clock otherwise. With a `timeout`, a run that has not reached a
    /// terminal phase by then is cancelled and fails with `Error::Timeout`.
    pub(crate) fn run(
        self: &Arc<Self>,
        publisher: &dyn Publisher<T>,
        clock: Option<&VirtualClock>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let subscriber: Arc<dyn Subscriber<T>> = Arc::clone(self) as Arc<dyn Subscriber<T>>;
        if let Err(error) = guarded(|| publisher.subscribe(subscriber)) {
            self.abort(error);
        }

        loop {
            self.drain_fused();
            match self.next_work(deadline, timeout) {
                Work::Done => break,
                Work::Idle => {}
                Work::Effect(to_cancel) => self.finish(to_cancel),
                Work::Request(subscription, n) => {
                    trace!(n, "requesting");
                    let outcome = guarded(|| subscription.request(n));
                    self.after_deferred(outcome);
                }
                Work::Await(duration) => {
                    let outcome = match clock {
                        Some(clock) => guarded(|| {
                            let fired = clock.advance(duration);
                            trace!(?duration, fired, now = ?clock.now(), "advanced virtual time");
                        }),
                        None => {
                            self.sleep(duration, deadline);
                            Ok(())
                        }
                    };
                    self.after_deferred(outcome);
                }
                Work::Run(action) => {
                    let outcome = guarded(|| action());
                    self.after_deferred(outcome);
                }
                Work::Inspect(inspection) => self.inspect(inspection),
                Work::Record(factory) => {
                    let outcome = guarded(|| factory()).map(Some);
                    self.after_recording(outcome);
                }
                Work::Recorded(index, recorded) => {
                    let outcome = self.check_recorded(index, recorded.as_deref());
                    self.after_recording(outcome.map(|()| None));
                }
            }
        }

        let verdict = self.state.lock().report();
        debug!(ok = verdict.is_ok(), "verification finished");
        verdict
    }

    /// Decides the next unit of work, waiting for a signal when there is none.
    fn next_work(&self, deadline: Option<Instant>, timeout: Option<Duration>) -> Work<T> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return Work::Done;
        }

        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                return Work::Effect(state.time_out(timeout));
            }
        }

        // Deferred steps may run before the subscription arrives, so a
        // virtual clock can drive a scheduled subscribe. Their demand is
        // sent once it does.
        if !state.is_busy() {
            match state.head(&self.steps) {
                Some(step) if step.kind() == StepKind::Deferred => {
                    return state.take_deferred(&self.steps)
                }
                _ if state.has_held() => return state.evaluate_held(&self.steps).into(),
                _ => {}
            }
        }

        match deadline {
            Some(deadline) => {
                self.changed.wait_until(&mut state, deadline);
            }
            None => self.changed.wait(&mut state),
        }
        Work::Idle
    }

    fn after_deferred(&self, outcome: Result<()>) {
        let to_cancel = {
            let mut state = self.state.lock();
            match outcome {
                Ok(()) => state.settle(&self.steps),
                Err(error) => state.fail(error),
            }
        };
        self.finish(to_cancel);
    }

    fn after_recording(&self, outcome: Result<Option<Vec<T>>>) {
        let to_cancel = self
            .state
            .lock()
            .conclude_recording(&self.steps, outcome);
        self.finish(to_cancel);
    }

    fn check_recorded(&self, index: usize, recorded: Option<&[T]>) -> Result<()> {
        match (self.steps.get(index), recorded) {
            (Some(step @ Step::Recorded(check)), Some(recorded)) => {
                check.check(&step.to_string(), recorded)
            }
            (Some(step), None) => Err(Error::mismatch(
                step.to_string(),
                "values collected by a preceding record_with",
                "no recorder installed",
            )),
            _ => Ok(()),
        }
    }

    /// Real-time pause for `then_await` without a virtual clock. Returns
    /// early once the run is decided or the overall deadline passes.
    fn sleep(&self, duration: Duration, deadline: Option<Instant>) {
        let mut until = Instant::now() + duration;
        if let Some(deadline) = deadline {
            until = until.min(deadline);
        }
        let mut state = self.state.lock();
        while !state.phase.is_terminal() {
            if self.changed.wait_until(&mut state, until).timed_out() {
                break;
            }
        }
    }
}
