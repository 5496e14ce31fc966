//! The protocol consumer.
//!
//! [`Engine`] is the subscriber handed to the publisher under test. Every
//! signal is first validated against the protocol (ordering, demand,
//! termination) and then matched against the step at the head of the
//! program. All bookkeeping lives in [`RunState`] behind one mutex; calls
//! back into the subscription and user code never happen while it is held,
//! so synchronous sources may emit from inside `request` or `cancel`, and
//! user closures may call back into the subscription.
//!
//! A step whose check runs user code is taken out under the lock as an
//! [`Inspection`], run unlocked, and its outcome recorded under the lock
//! again. While it runs the state is `busy` and arriving signals are held.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::step::{guarded, Action, RecorderFactory, Step, StepKind, SubscriptionCheck};
use crate::error::{Error, Result};
use crate::protocol::{
    add_demand, consume_demand, BoxError, FusionMode, QueueSubscription, Signal, Subscriber,
    Subscription,
};

pub(crate) type SubscriptionRef<T> = Arc<dyn Subscription<T>>;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Unsubscribed,
    Active,
    Completed,
    Errored,
    Cancelled,
    TimedOut,
    Failed,
}

impl Phase {
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, Self::Unsubscribed | Self::Active)
    }

    /// Phases in which late signals are dropped without evaluation.
    fn is_stopped(self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fusion {
    Off,
    Sync,
    Async,
}

/// Work the verifying thread performs after releasing the lock.
pub(crate) enum Work<T> {
    Done,
    Idle,
    Effect(Option<SubscriptionRef<T>>),
    Inspect(Inspection<T>),
    Request(SubscriptionRef<T>, u64),
    Await(Duration),
    Run(Action),
    Record(RecorderFactory<T>),
    /// Index of an `expect_recorded_*` step and the values recorded for it.
    Recorded(usize, Option<Vec<T>>),
}

/// What the delivering thread does once it has released the lock.
pub(crate) enum Delivery<T> {
    Settled(Option<SubscriptionRef<T>>),
    Inspect(Inspection<T>),
}

impl<T> From<Option<SubscriptionRef<T>>> for Delivery<T> {
    fn from(to_cancel: Option<SubscriptionRef<T>>) -> Self {
        Self::Settled(to_cancel)
    }
}

impl<T> From<Delivery<T>> for Work<T> {
    fn from(delivery: Delivery<T>) -> Self {
        match delivery {
            Delivery::Settled(to_cancel) => Self::Effect(to_cancel),
            Delivery::Inspect(inspection) => Self::Inspect(inspection),
        }
    }
}

/// A signal taken out of the state to be matched by user code.
pub(crate) struct Inspection<T> {
    index: usize,
    position: u64,
    signal: Signal<T>,
}

pub(crate) struct RunState<T> {
    pub(crate) phase: Phase,
    subscription: Option<SubscriptionRef<T>>,
    cancel_sent: bool,
    demand: u64,
    requested: u64,
    /// Demand declared before the subscription arrived, sent on subscribe.
    unsent: u64,
    upstream_done: bool,
    cursor: usize,
    /// Values still owed to an in-flight `expect_next_count`.
    remaining: Option<u64>,
    /// Values already matched by an in-flight `expect_next_sequence`.
    matched: usize,
    received: u64,
    held: VecDeque<Signal<T>>,
    /// User code or a subscription check is running without the lock.
    busy: bool,
    recorder: Option<Vec<T>>,
    pub(crate) fusion: Fusion,
    fused_terminal: Option<Signal<T>>,
    failure: Option<Error>,
    reported: bool,
}

impl<T: Debug + Send + Sync + 'static> RunState<T> {
    fn new() -> Self {
        Self {
            phase: Phase::Unsubscribed,
            subscription: None,
            cancel_sent: false,
            demand: 0,
            requested: 0,
            unsent: 0,
            upstream_done: false,
            cursor: 0,
            remaining: None,
            matched: 0,
            received: 0,
            held: VecDeque::new(),
            busy: false,
            recorder: None,
            fusion: Fusion::Off,
            fused_terminal: None,
            failure: None,
            reported: false,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn head<'s>(&self, steps: &'s [Step<T>]) -> Option<&'s Step<T>> {
        steps.get(self.cursor)
    }

    pub(crate) fn has_held(&self) -> bool {
        !self.held.is_empty()
    }

    fn head_kind(&self, steps: &[Step<T>]) -> Option<StepKind> {
        steps.get(self.cursor).map(Step::kind)
    }

    fn pending(&self, steps: &[Step<T>]) -> usize {
        steps.len().saturating_sub(self.cursor)
    }

    pub(crate) fn fail(&mut self, error: Error) -> Option<SubscriptionRef<T>> {
        if self.phase.is_stopped() {
            trace!(%error, "dropping failure raised after the run stopped");
            return None;
        }
        if self.reported {
            warn!(%error, "failure observed after the verdict was reported");
        } else {
            debug!(%error, "verification failed");
        }
        self.failure = Some(error);
        self.stop(Phase::Failed)
    }

    pub(crate) fn time_out(&mut self, timeout: Duration) -> Option<SubscriptionRef<T>> {
        debug!(?timeout, "verification timed out");
        self.failure = Some(Error::Timeout(timeout));
        self.stop(Phase::TimedOut)
    }

    fn stop(&mut self, phase: Phase) -> Option<SubscriptionRef<T>> {
        self.phase = phase;
        self.held.clear();
        self.fused_terminal = None;
        if self.cancel_sent || self.upstream_done {
            return None;
        }
        self.cancel_sent = true;
        self.subscription.clone()
    }

    fn advance(&mut self, steps: &[Step<T>]) -> Option<SubscriptionRef<T>> {
        self.cursor += 1;
        self.remaining = None;
        self.matched = 0;
        self.settle(steps)
    }

    /// Skips steps satisfied by nothing and performs a `then_cancel` that
    /// became the head.
    pub(crate) fn settle(&mut self, steps: &[Step<T>]) -> Option<SubscriptionRef<T>> {
        while let Some(step) = steps.get(self.cursor) {
            if step.is_vacuous() {
                self.cursor += 1;
            } else if step.kind() == StepKind::Cancel && self.phase == Phase::Active {
                self.cursor += 1;
                debug!("cancelling the subscription as declared");
                return self.stop(Phase::Cancelled);
            } else {
                break;
            }
        }
        None
    }

    fn accept_next(&mut self, steps: &[Step<T>], value: T) -> Delivery<T> {
        if self.phase.is_stopped() {
            return Delivery::Settled(None);
        }
        if self.phase == Phase::Unsubscribed {
            return self
                .fail(Error::protocol_violation(format!(
                    "onNext({value:?}) received before onSubscribe"
                )))
                .into();
        }
        if self.upstream_done {
            return self
                .fail(Error::protocol_violation(format!(
                    "onNext({value:?}) received after a terminal signal"
                )))
                .into();
        }
        if self.fusion != Fusion::Off {
            return self
                .fail(Error::protocol_violation(format!(
                    "onNext({value:?}) pushed to a fused consumer"
                )))
                .into();
        }
        if self.demand == 0 {
            return self
                .fail(Error::protocol_violation(format!(
                    "onNext({value:?}) received without outstanding demand ({} requested in total)",
                    self.requested
                )))
                .into();
        }
        self.demand = consume_demand(self.demand);
        self.deliver(steps, Signal::Next(value))
    }

    fn accept_terminal(&mut self, steps: &[Step<T>], signal: Signal<T>) -> Delivery<T> {
        if self.phase.is_stopped() {
            return Delivery::Settled(None);
        }
        if self.phase == Phase::Unsubscribed {
            return self
                .fail(Error::protocol_violation(format!(
                    "{signal:?} received before onSubscribe"
                )))
                .into();
        }
        if self.upstream_done {
            return self
                .fail(Error::protocol_violation(format!(
                    "{signal:?} received after a terminal signal"
                )))
                .into();
        }
        self.upstream_done = true;
        if self.fusion == Fusion::Async {
            // Delivered once the queue has been drained.
            self.fused_terminal = Some(signal);
            return Delivery::Settled(None);
        }
        self.deliver(steps, signal)
    }

    fn deliver(&mut self, steps: &[Step<T>], signal: Signal<T>) -> Delivery<T> {
        let blocked = self.busy
            || matches!(
                self.head_kind(steps),
                Some(StepKind::Deferred | StepKind::Cancel)
            );
        if blocked || !self.held.is_empty() {
            trace!(?signal, "holding signal");
            self.held.push_back(signal);
            return Delivery::Settled(None);
        }
        self.evaluate(steps, signal)
    }

    pub(crate) fn evaluate_held(&mut self, steps: &[Step<T>]) -> Delivery<T> {
        match self.held.pop_front() {
            Some(signal) => self.evaluate(steps, signal),
            None => Delivery::Settled(None),
        }
    }

    fn evaluate(&mut self, steps: &[Step<T>], signal: Signal<T>) -> Delivery<T> {
        if matches!(signal, Signal::Next(_)) {
            self.received += 1;
        }
        if steps
            .get(self.cursor)
            .is_some_and(|step| step.runs_user_code(&signal))
        {
            self.busy = true;
            return Delivery::Inspect(Inspection {
                index: self.cursor,
                position: self.received,
                signal,
            });
        }
        match signal {
            Signal::Next(value) => self.on_value(steps, value).into(),
            terminal => self.on_terminal(steps, terminal).into(),
        }
    }

    /// Records the outcome of an [`Inspection`] run without the lock.
    fn conclude(
        &mut self,
        steps: &[Step<T>],
        inspection: Inspection<T>,
        outcome: Result<()>,
    ) -> Option<SubscriptionRef<T>> {
        self.busy = false;
        if self.phase != Phase::Active {
            return None;
        }
        if let Err(error) = outcome {
            return self.fail(error);
        }
        match inspection.signal {
            Signal::Next(value) => {
                trace!(?value, "matched onNext");
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.push(value);
                }
                self.advance(steps)
            }
            Signal::Error(error) => {
                self.cursor += 1;
                self.phase = Phase::Errored;
                debug!(%error, "matched onError");
                None
            }
            Signal::Complete => None,
        }
    }

    fn on_value(&mut self, steps: &[Step<T>], value: T) -> Option<SubscriptionRef<T>> {
        let Some(step) = steps.get(self.cursor) else {
            return self.fail(Error::mismatch(
                "end of program",
                "no further signal",
                format!("onNext({value:?})"),
            ));
        };
        let done = match self.match_value(step, &value) {
            Ok(done) => done,
            Err(error) => return self.fail(error),
        };
        trace!(step = %step, ?value, "matched onNext");
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.push(value);
        }
        if done {
            self.advance(steps)
        } else {
            None
        }
    }

    /// Returns whether the step is fully satisfied after this value.
    fn match_value(&mut self, step: &Step<T>, value: &T) -> Result<bool> {
        let position = self.received;
        match step {
            Step::NextEquals { expected, eq } => {
                if eq(expected, value) {
                    Ok(true)
                } else {
                    Err(Error::mismatch(
                        step.to_string(),
                        format!("{expected:?}"),
                        format!("{value:?} (onNext #{position})"),
                    ))
                }
            }
            Step::NextSequence { values, eq } => {
                let Some(expected) = values.get(self.matched) else {
                    return Ok(true);
                };
                if eq(expected, value) {
                    self.matched += 1;
                    Ok(self.matched == values.len())
                } else {
                    Err(Error::mismatch(
                        step.to_string(),
                        format!("{expected:?} at index {} of the sequence", self.matched),
                        format!("{value:?} (onNext #{position})"),
                    ))
                }
            }
            Step::NextCount(count) => {
                let remaining = self.remaining.get_or_insert(*count);
                *remaining = remaining.saturating_sub(1);
                Ok(*remaining == 0)
            }
            other => Err(Error::mismatch(
                other.to_string(),
                other.expectation(),
                format!("onNext({value:?})"),
            )),
        }
    }

    fn on_terminal(&mut self, steps: &[Step<T>], signal: Signal<T>) -> Option<SubscriptionRef<T>> {
        let pending = self.pending(steps);
        let Some(step) = steps.get(self.cursor) else {
            return self.fail(Error::mismatch(
                "end of program",
                "no further signal",
                format!("{signal:?}"),
            ));
        };
        match (step, signal) {
            (Step::Complete, Signal::Complete) => {
                self.cursor += 1;
                self.phase = Phase::Completed;
                debug!("matched onComplete()");
                None
            }
            (Step::Error(check), Signal::Error(error)) => {
                match check.check(&step.to_string(), &*error) {
                    Ok(()) => {
                        self.cursor += 1;
                        self.phase = Phase::Errored;
                        debug!(%error, "matched onError");
                        None
                    }
                    Err(mismatch) => self.fail(mismatch),
                }
            }
            (step, signal) => {
                let observed = if matches!(signal, Signal::Complete) {
                    "completion"
                } else {
                    "error"
                };
                let expected = self.expected_at(step);
                self.fail(Error::mismatch(
                    step.to_string(),
                    expected,
                    format!("{signal:?}: unexpected {observed}, {pending} step(s) still pending"),
                ))
            }
        }
    }

    fn expected_at(&self, step: &Step<T>) -> String {
        match step {
            Step::NextCount(count) => {
                format!("{} more onNext(..)", self.remaining.unwrap_or(*count))
            }
            Step::NextSequence { values, .. } => match values.get(self.matched) {
                Some(value) => format!("onNext({value:?})"),
                None => step.expectation(),
            },
            _ => step.expectation(),
        }
    }

    /// Pops the deferred step at the head. The cursor moves before the step
    /// runs so that signals emitted while it runs see the following step.
    /// Recording steps run user code, so signals are held until they finish.
    pub(crate) fn take_deferred(&mut self, steps: &[Step<T>]) -> Work<T> {
        let Some(step) = steps.get(self.cursor) else {
            return Work::Idle;
        };
        let index = self.cursor;
        self.cursor += 1;
        trace!(step = %step, "running deferred step");
        match step {
            Step::Request(n) => {
                self.demand = add_demand(self.demand, *n);
                self.requested = add_demand(self.requested, *n);
                match (&self.subscription, self.fusion) {
                    (None, _) => {
                        self.unsent = add_demand(self.unsent, *n);
                        Work::Effect(self.settle(steps))
                    }
                    (Some(_), Fusion::Sync) => Work::Effect(self.settle(steps)),
                    (Some(subscription), _) => Work::Request(Arc::clone(subscription), *n),
                }
            }
            Step::Await(duration) => Work::Await(*duration),
            Step::Run(action) => Work::Run(Arc::clone(action)),
            Step::RecordWith(factory) => {
                self.busy = true;
                Work::Record(Arc::clone(factory))
            }
            Step::Recorded(_) => {
                self.busy = true;
                Work::Recorded(index, self.recorder.take())
            }
            _ => Work::Idle,
        }
    }

    /// Records the outcome of a recording step run by the verifying thread.
    pub(crate) fn conclude_recording(
        &mut self,
        steps: &[Step<T>],
        outcome: Result<Option<Vec<T>>>,
    ) -> Option<SubscriptionRef<T>> {
        self.busy = false;
        match outcome {
            Ok(recorder) => {
                if recorder.is_some() {
                    self.recorder = recorder;
                }
                self.settle(steps)
            }
            Err(error) => self.fail(error),
        }
    }

    /// Whether the verifier should pull from a fused queue right now.
    fn ready_to_pull(&self, steps: &[Step<T>]) -> bool {
        self.phase == Phase::Active
            && self.fusion != Fusion::Off
            && !self.busy
            && self.held.is_empty()
            && matches!(
                self.head_kind(steps),
                Some(StepKind::Value | StepKind::Terminal)
            )
    }

    pub(crate) fn report(&mut self) -> Result<()> {
        self.reported = true;
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Evaluates one subscription step. Returns the fusion mode it negotiated.
fn check_subscription<T: Debug>(
    step: &Step<T>,
    subscription: &dyn Subscription<T>,
) -> Result<Option<Fusion>> {
    match step {
        Step::Subscription(SubscriptionCheck::Any) => Ok(None),
        Step::Subscription(SubscriptionCheck::Matches(predicate)) => {
            if guarded(|| predicate(subscription))? {
                Ok(None)
            } else {
                Err(Error::mismatch(
                    step.to_string(),
                    "a subscription matching the predicate",
                    "a subscription rejected by the predicate",
                ))
            }
        }
        Step::Subscription(SubscriptionCheck::Consume(inspect)) => {
            guarded(|| inspect(subscription)).map(|()| None)
        }
        Step::Fusion {
            requested,
            expected,
        } => negotiate(step, subscription, *requested, *expected).map(Some),
        Step::NoFusion => match subscription.as_queue() {
            None => Ok(None),
            Some(queue) => {
                let granted = queue.request_fusion(FusionMode::ANY);
                if granted.without_barrier().is_none() {
                    Ok(None)
                } else {
                    Err(Error::mismatch(
                        step.to_string(),
                        "no fusion",
                        format!("fusion mode {granted}"),
                    ))
                }
            }
        },
        other => Err(Error::mismatch(
            other.to_string(),
            other.expectation(),
            "onSubscribe(..)",
        )),
    }
}

fn negotiate<T: Debug>(
    step: &Step<T>,
    subscription: &dyn Subscription<T>,
    requested: FusionMode,
    expected: Option<FusionMode>,
) -> Result<Fusion> {
    let Some(queue) = subscription.as_queue() else {
        return Err(Error::mismatch(
            step.to_string(),
            format!("a subscription supporting fusion mode {requested}"),
            "a subscription without queue support",
        ));
    };
    let granted = queue.request_fusion(requested);
    debug!(%requested, %granted, "fusion negotiated");

    let mode = granted.without_barrier();
    match expected {
        Some(expected) if granted != expected => {
            return Err(Error::mismatch(
                step.to_string(),
                format!("fusion mode {expected}"),
                format!("fusion mode {granted}"),
            ));
        }
        Some(_) => {}
        None if mode.is_none() || !requested.contains(mode) => {
            return Err(Error::mismatch(
                step.to_string(),
                format!("a fusion mode within {requested}"),
                format!("fusion mode {granted}"),
            ));
        }
        None => {}
    }

    Ok(if mode.contains(FusionMode::SYNC) {
        Fusion::Sync
    } else if mode.contains(FusionMode::ASYNC) {
        Fusion::Async
    } else {
        Fusion::Off
    })
}

/// The subscription as handed to subscription steps. Demand requested
/// through it counts as the verifier's own.
struct Tracked<'a, T> {
    engine: &'a Engine<T>,
    inner: &'a dyn Subscription<T>,
}

impl<T: Debug + Send + Sync + 'static> Subscription<T> for Tracked<'_, T> {
    fn request(&self, n: u64) {
        {
            let mut state = self.engine.state.lock();
            state.demand = add_demand(state.demand, n);
            state.requested = add_demand(state.requested, n);
        }
        self.inner.request(n);
    }

    fn cancel(&self) {
        self.engine.state.lock().cancel_sent = true;
        self.inner.cancel();
    }

    fn as_queue(&self) -> Option<&dyn QueueSubscription<T>> {
        self.inner.as_queue()
    }
}

/// The subscriber driving one verification run.
pub(crate) struct Engine<T> {
    pub(crate) steps: Arc<[Step<T>]>,
    initial_request: u64,
    pub(crate) state: Mutex<RunState<T>>,
    pub(crate) changed: Condvar,
    wip: AtomicUsize,
}

impl<T: Debug + Send + Sync + 'static> Engine<T> {
    pub(crate) fn new(steps: Arc<[Step<T>]>, initial_request: u64) -> Arc<Self> {
        Arc::new(Self {
            steps,
            initial_request,
            state: Mutex::new(RunState::new()),
            changed: Condvar::new(),
            wip: AtomicUsize::new(0),
        })
    }

    /// Wakes the verifying thread and applies a pending cancellation.
    pub(crate) fn finish(&self, to_cancel: Option<SubscriptionRef<T>>) {
        self.changed.notify_all();
        if let Some(subscription) = to_cancel {
            subscription.cancel();
        }
    }

    pub(crate) fn abort(&self, error: Error) {
        let to_cancel = self.state.lock().fail(error);
        self.finish(to_cancel);
    }

    pub(crate) fn dispatch(&self, delivery: Delivery<T>) {
        match delivery {
            Delivery::Settled(to_cancel) => self.finish(to_cancel),
            Delivery::Inspect(inspection) => self.inspect(inspection),
        }
    }

    /// Runs the user code of a taken step without the lock, then records
    /// the outcome.
    pub(crate) fn inspect(&self, inspection: Inspection<T>) {
        let outcome = match self.steps.get(inspection.index) {
            Some(step) => step.inspect(&inspection.signal, inspection.position),
            None => Ok(()),
        };
        let to_cancel = self
            .state
            .lock()
            .conclude(&self.steps, inspection, outcome);
        self.finish(to_cancel);
    }

    /// Pulls from a fused queue while the program is waiting for values.
    /// Reentrant calls fold into the active drain.
    pub(crate) fn drain_fused(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            self.pull_available();
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn pull_available(&self) {
        loop {
            // The terminal is delivered on an empty poll only if it had
            // arrived before that poll started.
            let (subscription, terminal_arrived) = {
                let state = self.state.lock();
                if !state.ready_to_pull(&self.steps) {
                    return;
                }
                match &state.subscription {
                    Some(subscription) => {
                        (Arc::clone(subscription), state.fused_terminal.is_some())
                    }
                    None => return,
                }
            };
            let Some(queue) = subscription.as_queue() else {
                return;
            };
            let polled = match guarded(|| queue.poll()) {
                Ok(polled) => polled,
                Err(error) => return self.abort(error),
            };

            let delivery = {
                let mut state = self.state.lock();
                if state.phase != Phase::Active {
                    return;
                }
                match polled {
                    Ok(Some(value)) => state.deliver(&self.steps, Signal::Next(value)),
                    Ok(None) if state.fusion == Fusion::Sync => {
                        state.upstream_done = true;
                        state.deliver(&self.steps, Signal::Complete)
                    }
                    Ok(None) if !terminal_arrived => {
                        if state.fused_terminal.is_some() {
                            // Values queued before the terminal may remain.
                            continue;
                        }
                        return;
                    }
                    Ok(None) => match state.fused_terminal.take() {
                        Some(terminal) => state.deliver(&self.steps, terminal),
                        None => return,
                    },
                    Err(error) => {
                        state.upstream_done = true;
                        state.deliver(&self.steps, Signal::Error(error))
                    }
                }
            };
            self.dispatch(delivery);
        }
    }

    /// Moves the cursor past the subscription steps at the head and marks
    /// the state busy while they run.
    fn take_subscription_steps(&self, state: &mut RunState<T>) -> Range<usize> {
        let first = state.cursor;
        while self
            .steps
            .get(state.cursor)
            .is_some_and(|step| step.kind() == StepKind::Subscription)
        {
            state.cursor += 1;
        }
        state.busy = state.cursor > first;
        first..state.cursor
    }
}

impl<T: Debug + Send + Sync + 'static> Subscriber<T> for Engine<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription<T>>) {
        let checks = {
            let mut state = self.state.lock();
            if state.phase != Phase::Unsubscribed {
                let existing = state.fail(Error::protocol_violation(
                    "onSubscribe received more than once",
                ));
                drop(state);
                subscription.cancel();
                return self.finish(existing);
            }

            debug!(initial_request = self.initial_request, "subscribed");
            state.subscription = Some(Arc::clone(&subscription));
            state.phase = Phase::Active;
            self.take_subscription_steps(&mut state)
        };

        let tracked = Tracked {
            engine: self,
            inner: &*subscription,
        };
        let mut fusion = None;
        let mut outcome = Ok(());
        for step in self.steps.iter().take(checks.end).skip(checks.start) {
            match check_subscription(step, &tracked) {
                Ok(granted) => fusion = granted.or(fusion),
                Err(error) => {
                    outcome = Err(error);
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        state.busy = false;
        if let Some(fusion) = fusion {
            state.fusion = fusion;
            if fusion == Fusion::Async && state.held.back().is_some_and(Signal::is_terminal) {
                // A terminal that raced the negotiation trails the queue.
                state.fused_terminal = state.held.pop_back();
            }
        }
        if let Err(error) = outcome {
            let to_cancel = state.fail(error);
            drop(state);
            return self.finish(to_cancel);
        }
        if let Some(to_cancel) = state.settle(&self.steps) {
            drop(state);
            return self.finish(Some(to_cancel));
        }

        let to_request = add_demand(self.initial_request, state.unsent);
        state.unsent = 0;
        if state.phase != Phase::Active || state.fusion == Fusion::Sync || to_request == 0 {
            drop(state);
            self.finish(None);
            return self.drain_fused();
        }

        state.demand = add_demand(state.demand, self.initial_request);
        state.requested = add_demand(state.requested, self.initial_request);
        drop(state);
        self.changed.notify_all();
        subscription.request(to_request);
        self.drain_fused();
    }

    fn on_next(&self, value: T) {
        let delivery = self.state.lock().accept_next(&self.steps, value);
        self.dispatch(delivery);
    }

    fn on_error(&self, error: BoxError) {
        let delivery = self
            .state
            .lock()
            .accept_terminal(&self.steps, Signal::Error(error));
        self.dispatch(delivery);
        self.drain_fused();
    }

    fn on_complete(&self) {
        let delivery = self
            .state
            .lock()
            .accept_terminal(&self.steps, Signal::Complete);
        self.dispatch(delivery);
        self.drain_fused();
    }

    fn on_queue_ready(&self) {
        self.drain_fused();
    }
}
