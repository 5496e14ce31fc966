//! Declaration builder.
//!
//! [`Steps`] accumulates a program one step at a time. Terminal declarations
//! turn it into a [`Verification`], which is immutable and can be verified
//! any number of times against fresh subscriptions.

use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug_span;

use super::engine::Engine;
use super::options::StepVerifierOptions;
use super::step::{
    guarded, is_error_kind, ErrorCheck, RecordedCheck, SignalError, Step, SubscriptionCheck,
};
use crate::clock::VirtualClock;
use crate::error::{Error, Result};
use crate::protocol::{FusionMode, Publisher, Subscription};

type PublisherRef<T> = Arc<dyn Publisher<T>>;

/// Where each run obtains its publisher.
pub(crate) enum Source<T> {
    Shared(PublisherRef<T>),
    Factory(Arc<dyn Fn() -> PublisherRef<T> + Send + Sync>),
    VirtualTime(Arc<dyn Fn(&VirtualClock) -> PublisherRef<T> + Send + Sync>),
    Once(Mutex<Option<PublisherRef<T>>>),
}

impl<T> Source<T> {
    fn open(&self, options: &StepVerifierOptions) -> Result<(PublisherRef<T>, Option<VirtualClock>)> {
        match self {
            Self::Shared(publisher) => Ok((Arc::clone(publisher), options.virtual_clock.clone())),
            Self::Factory(factory) => Ok((guarded(|| factory())?, options.virtual_clock.clone())),
            Self::VirtualTime(factory) => {
                let clock = options
                    .virtual_clock
                    .clone()
                    .unwrap_or_else(VirtualClock::new);
                let publisher = guarded(|| factory(&clock))?;
                Ok((publisher, Some(clock)))
            }
            Self::Once(slot) => match slot.lock().take() {
                Some(publisher) => Ok((publisher, options.virtual_clock.clone())),
                None => Err(Error::usage(
                    "the publisher was handed over with create_once and has already been verified",
                )),
            },
        }
    }
}

/// A program under construction.
///
/// Returned by the [`StepVerifier`](super::StepVerifier) entry points. Every
/// method appends one step; the terminal ones (`expect_complete`,
/// `expect_error*`, `consume_error_with`, `then_cancel`) return a
/// [`Verification`].
#[must_use = "a program does nothing until it is terminated and verified"]
pub struct Steps<T> {
    source: Arc<Source<T>>,
    options: StepVerifierOptions,
    steps: Vec<Step<T>>,
}

impl<T: Debug + Send + Sync + 'static> Steps<T> {
    pub(crate) fn new(source: Source<T>, options: StepVerifierOptions) -> Self {
        Self {
            source: Arc::new(source),
            options,
            steps: Vec::new(),
        }
    }

    fn push(mut self, step: Step<T>) -> Self {
        self.steps.push(step);
        self
    }

    fn finish(mut self, step: Step<T>) -> Verification<T> {
        self.steps.push(step);
        Verification {
            source: self.source,
            options: self.options,
            steps: self.steps.into(),
        }
    }

    /// Expects the subscription to be received.
    pub fn expect_subscription(self) -> Self {
        self.push(Step::Subscription(SubscriptionCheck::Any))
    }

    /// Expects a subscription satisfying `predicate`.
    pub fn expect_subscription_matches<F>(self, predicate: F) -> Self
    where
        F: Fn(&dyn Subscription<T>) -> bool + Send + Sync + 'static,
    {
        self.push(Step::Subscription(SubscriptionCheck::Matches(Arc::new(
            predicate,
        ))))
    }

    /// Hands the subscription to `inspect`; a panic inside it fails the run.
    ///
    /// Demand requested through the subscription inside `inspect` counts as
    /// the verifier's own, so values it produces are matched by later steps.
    pub fn consume_subscription_with<F>(self, inspect: F) -> Self
    where
        F: Fn(&dyn Subscription<T>) + Send + Sync + 'static,
    {
        self.push(Step::Subscription(SubscriptionCheck::Consume(Arc::new(
            inspect,
        ))))
    }

    /// Expects the subscription to grant any fusion mode.
    pub fn expect_fusion(self) -> Self {
        self.expect_fusion_mode(FusionMode::ANY)
    }

    /// Requests `requested` and expects a granted mode within it.
    pub fn expect_fusion_mode(self, requested: FusionMode) -> Self {
        self.push(Step::Fusion {
            requested,
            expected: None,
        })
    }

    /// Requests `requested` and expects exactly `expected` to be granted.
    pub fn expect_fusion_modes(self, requested: FusionMode, expected: FusionMode) -> Self {
        self.push(Step::Fusion {
            requested,
            expected: Some(expected),
        })
    }

    /// Expects the subscription to lack queue support or grant nothing.
    pub fn expect_no_fusion(self) -> Self {
        self.push(Step::NoFusion)
    }

    /// Expects the next value to equal `value`.
    pub fn expect_next(self, value: T) -> Self
    where
        T: PartialEq,
    {
        self.push(Step::NextEquals {
            expected: value,
            eq: PartialEq::eq,
        })
    }

    /// Expects each of `values` in turn, one step per value.
    pub fn expect_next_values<I>(self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: PartialEq,
    {
        values
            .into_iter()
            .fold(self, |steps, value| steps.expect_next(value))
    }

    /// Expects the next values to equal `values`, as a single step.
    pub fn expect_next_sequence<I>(self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: PartialEq,
    {
        self.push(Step::NextSequence {
            values: values.into_iter().collect(),
            eq: PartialEq::eq,
        })
    }

    /// Expects the next value to satisfy `predicate`.
    pub fn expect_next_matches<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.push(Step::NextMatches(Arc::new(predicate)))
    }

    /// Hands the next value to `inspect`; a panic inside it fails the run
    /// with the panic message.
    pub fn consume_next_with<F>(self, inspect: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.push(Step::ConsumeNext(Arc::new(inspect)))
    }

    /// Expects exactly `count` more values, whatever they are.
    pub fn expect_next_count(self, count: u64) -> Self {
        self.push(Step::NextCount(count))
    }

    /// Requests `n` more values from the subscription.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn then_request(self, n: u64) -> Self {
        assert!(n > 0, "then_request needs a positive demand, got 0");
        self.push(Step::Request(n))
    }

    /// Lets `duration` pass: advances the bound virtual clock, or sleeps.
    pub fn then_await(self, duration: Duration) -> Self {
        self.push(Step::Await(duration))
    }

    /// Runs `action` on the verifying thread once the previous step is
    /// satisfied.
    pub fn then<F>(self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(Step::Run(Arc::new(action)))
    }

    /// Starts recording the values that follow into the collection returned
    /// by `supplier`.
    pub fn record_with<F>(self, supplier: F) -> Self
    where
        F: Fn() -> Vec<T> + Send + Sync + 'static,
    {
        self.push(Step::RecordWith(Arc::new(supplier)))
    }

    /// Stops recording and expects the recorded values to satisfy `predicate`.
    pub fn expect_recorded_matches<F>(self, predicate: F) -> Self
    where
        F: Fn(&[T]) -> bool + Send + Sync + 'static,
    {
        self.push(Step::Recorded(RecordedCheck::Matches(Arc::new(predicate))))
    }

    /// Stops recording and hands the recorded values to `inspect`.
    pub fn consume_recorded_with<F>(self, inspect: F) -> Self
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.push(Step::Recorded(RecordedCheck::Consume(Arc::new(inspect))))
    }

    /// Cancels the subscription and ends the program.
    pub fn then_cancel(self) -> Verification<T> {
        self.finish(Step::Cancel)
    }

    /// Expects completion and ends the program.
    pub fn expect_complete(self) -> Verification<T> {
        self.finish(Step::Complete)
    }

    /// Expects any error and ends the program.
    pub fn expect_error(self) -> Verification<T> {
        self.finish(Step::Error(ErrorCheck::Any))
    }

    /// Expects an error of type `E` and ends the program.
    pub fn expect_error_of<E>(self) -> Verification<T>
    where
        E: StdError + 'static,
    {
        self.finish(Step::Error(ErrorCheck::Kind {
            name: std::any::type_name::<E>(),
            is: is_error_kind::<E>,
        }))
    }

    /// Expects an error whose message is exactly `message`.
    pub fn expect_error_message(self, message: impl Into<String>) -> Verification<T> {
        self.finish(Step::Error(ErrorCheck::Message(message.into())))
    }

    /// Expects an error satisfying `predicate`.
    pub fn expect_error_matches<F>(self, predicate: F) -> Verification<T>
    where
        F: Fn(&SignalError) -> bool + Send + Sync + 'static,
    {
        self.finish(Step::Error(ErrorCheck::Matches(Arc::new(predicate))))
    }

    /// Hands the error to `inspect`; a panic inside it fails the run.
    pub fn consume_error_with<F>(self, inspect: F) -> Verification<T>
    where
        F: Fn(&SignalError) + Send + Sync + 'static,
    {
        self.finish(Step::Error(ErrorCheck::Consume(Arc::new(inspect))))
    }
}

impl<T: Debug> Debug for Steps<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(ToString::to_string))
            .finish()
    }
}

/// A complete program, ready to be verified.
///
/// Each verification subscribes afresh and runs the whole program on the
/// calling thread. On success the elapsed wall-clock time is returned.
#[must_use = "a program does nothing until verified"]
pub struct Verification<T> {
    source: Arc<Source<T>>,
    options: StepVerifierOptions,
    steps: Arc<[Step<T>]>,
}

impl<T: Debug + Send + Sync + 'static> Verification<T> {
    /// Runs the program with the configured default timeout.
    ///
    /// # Panics
    ///
    /// Panics with the failure message if verification fails.
    #[track_caller]
    pub fn verify(&self) -> Duration {
        self.unwrap_verdict(self.try_verify())
    }

    /// Runs the program, failing if it has not finished within `timeout`.
    ///
    /// # Panics
    ///
    /// Panics with the failure message if verification fails.
    #[track_caller]
    pub fn verify_timeout(&self, timeout: Duration) -> Duration {
        self.unwrap_verdict(self.try_verify_timeout(timeout))
    }

    /// Runs the program with the configured default timeout.
    ///
    /// # Errors
    ///
    /// Returns the first failure observed during the run.
    pub fn try_verify(&self) -> Result<Duration> {
        self.execute(self.options.default_timeout)
    }

    /// Runs the program, failing if it has not finished within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the deadline passes first, or the
    /// first failure observed during the run.
    pub fn try_verify_timeout(&self, timeout: Duration) -> Result<Duration> {
        self.execute(Some(timeout))
    }

    fn execute(&self, timeout: Option<Duration>) -> Result<Duration> {
        let started = Instant::now();
        let span = debug_span!(
            "verify",
            scenario = self.options.scenario_name.as_deref().unwrap_or_default(),
            steps = self.steps.len(),
        );
        let _entered = span.enter();

        let (publisher, clock) = self.source.open(&self.options)?;
        let engine = Engine::new(Arc::clone(&self.steps), self.options.initial_request);
        engine.run(&*publisher, clock.as_ref(), timeout)?;
        Ok(started.elapsed())
    }

    #[track_caller]
    fn unwrap_verdict(&self, verdict: Result<Duration>) -> Duration {
        match (verdict, &self.options.scenario_name) {
            (Ok(elapsed), _) => elapsed,
            // User panics are re-raised with their message unchanged.
            (Err(error @ Error::Action(_)), _) | (Err(error), None) => panic!("{error}"),
            (Err(error), Some(name)) => panic!("[{name}] {error}"),
        }
    }
}

impl<T: Debug> Debug for Verification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verification")
            .field("scenario", &self.options.scenario_name)
            .field(
                "steps",
                &self.steps.iter().map(ToString::to_string).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
