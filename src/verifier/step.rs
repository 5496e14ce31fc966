//! Declared steps of an expectation program.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{FusionMode, Signal, Subscription};

/// The error type observed through `on_error`, borrowed.
pub type SignalError = dyn StdError + Send + Sync + 'static;

pub(crate) type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
pub(crate) type Inspect<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub(crate) type SubscriptionPredicate<T> = Arc<dyn Fn(&dyn Subscription<T>) -> bool + Send + Sync>;
pub(crate) type SubscriptionInspect<T> = Arc<dyn Fn(&dyn Subscription<T>) + Send + Sync>;
pub(crate) type ErrorPredicate = Arc<dyn Fn(&SignalError) -> bool + Send + Sync>;
pub(crate) type ErrorInspect = Arc<dyn Fn(&SignalError) + Send + Sync>;
pub(crate) type RecordedPredicate<T> = Arc<dyn Fn(&[T]) -> bool + Send + Sync>;
pub(crate) type RecordedInspect<T> = Arc<dyn Fn(&[T]) + Send + Sync>;
pub(crate) type RecorderFactory<T> = Arc<dyn Fn() -> Vec<T> + Send + Sync>;
pub(crate) type Action = Arc<dyn Fn() + Send + Sync>;

/// One declared step. The program is a `Vec<Step<T>>` walked in order.
pub(crate) enum Step<T> {
    Subscription(SubscriptionCheck<T>),
    Fusion {
        requested: FusionMode,
        expected: Option<FusionMode>,
    },
    NoFusion,
    NextEquals {
        expected: T,
        eq: fn(&T, &T) -> bool,
    },
    NextMatches(Predicate<T>),
    ConsumeNext(Inspect<T>),
    NextSequence {
        values: Vec<T>,
        eq: fn(&T, &T) -> bool,
    },
    NextCount(u64),
    Complete,
    Error(ErrorCheck),
    Request(u64),
    Cancel,
    Await(Duration),
    Run(Action),
    RecordWith(RecorderFactory<T>),
    Recorded(RecordedCheck<T>),
}

pub(crate) enum SubscriptionCheck<T> {
    Any,
    Matches(SubscriptionPredicate<T>),
    Consume(SubscriptionInspect<T>),
}

pub(crate) enum ErrorCheck {
    Any,
    Kind {
        name: &'static str,
        is: fn(&SignalError) -> bool,
    },
    Message(String),
    Matches(ErrorPredicate),
    Consume(ErrorInspect),
}

pub(crate) enum RecordedCheck<T> {
    Matches(RecordedPredicate<T>),
    Consume(RecordedInspect<T>),
}

/// How the engine treats the step when it reaches the head of the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepKind {
    /// Evaluated against the subscription in `on_subscribe`.
    Subscription,
    /// Consumes an `on_next`.
    Value,
    /// Consumes `on_complete` or `on_error`.
    Terminal,
    /// Runs on the verifying thread between signals.
    Deferred,
    /// Cancels the subscription as soon as it becomes the head.
    Cancel,
}

pub(crate) fn is_error_kind<E: StdError + 'static>(error: &SignalError) -> bool {
    error.is::<E>()
}

impl<T: Debug> Step<T> {
    pub(crate) fn kind(&self) -> StepKind {
        match self {
            Self::Subscription(_) | Self::Fusion { .. } | Self::NoFusion => StepKind::Subscription,
            Self::NextEquals { .. }
            | Self::NextMatches(_)
            | Self::ConsumeNext(_)
            | Self::NextSequence { .. }
            | Self::NextCount(_) => StepKind::Value,
            Self::Complete | Self::Error(_) => StepKind::Terminal,
            Self::Request(_)
            | Self::Await(_)
            | Self::Run(_)
            | Self::RecordWith(_)
            | Self::Recorded(_) => StepKind::Deferred,
            Self::Cancel => StepKind::Cancel,
        }
    }

    /// Steps that are satisfied without observing anything.
    pub(crate) fn is_vacuous(&self) -> bool {
        match self {
            Self::NextCount(n) => *n == 0,
            Self::NextSequence { values, .. } => values.is_empty(),
            _ => false,
        }
    }

    /// Whether matching `signal` against this step calls into user code.
    pub(crate) fn runs_user_code(&self, signal: &Signal<T>) -> bool {
        matches!(
            (self, signal),
            (Self::NextMatches(_) | Self::ConsumeNext(_), Signal::Next(_))
                | (
                    Self::Error(ErrorCheck::Matches(_) | ErrorCheck::Consume(_)),
                    Signal::Error(_)
                )
        )
    }

    /// Runs the user code of a step selected by
    /// [`runs_user_code`](Self::runs_user_code). `position` numbers the value
    /// among all `on_next` signals.
    pub(crate) fn inspect(&self, signal: &Signal<T>, position: u64) -> Result<()> {
        match (self, signal) {
            (Self::NextMatches(predicate), Signal::Next(value)) => {
                if guarded(|| predicate(value))? {
                    Ok(())
                } else {
                    Err(Error::mismatch(
                        self.to_string(),
                        "a value matching the predicate",
                        format!("{value:?} (onNext #{position})"),
                    ))
                }
            }
            (Self::ConsumeNext(inspect), Signal::Next(value)) => guarded(|| inspect(value)),
            (Self::Error(check), Signal::Error(error)) => check.check(&self.to_string(), &**error),
            _ => Ok(()),
        }
    }

    /// What a step of this kind is waiting for, for mismatch messages.
    pub(crate) fn expectation(&self) -> String {
        match self.kind() {
            StepKind::Subscription => "onSubscribe(..)".to_string(),
            StepKind::Value => "onNext(..)".to_string(),
            StepKind::Terminal => match self {
                Self::Complete => "onComplete()".to_string(),
                _ => "onError(..)".to_string(),
            },
            StepKind::Deferred | StepKind::Cancel => "no signal".to_string(),
        }
    }
}

impl<T: Debug> fmt::Display for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscription(SubscriptionCheck::Any) => f.write_str("expect_subscription()"),
            Self::Subscription(SubscriptionCheck::Matches(_)) => {
                f.write_str("expect_subscription_matches(..)")
            }
            Self::Subscription(SubscriptionCheck::Consume(_)) => {
                f.write_str("consume_subscription_with(..)")
            }
            Self::Fusion {
                requested,
                expected: Some(expected),
            } => write!(f, "expect_fusion_modes({requested}, {expected})"),
            Self::Fusion {
                requested,
                expected: None,
            } => write!(f, "expect_fusion_mode({requested})"),
            Self::NoFusion => f.write_str("expect_no_fusion()"),
            Self::NextEquals { expected, .. } => write!(f, "expect_next({expected:?})"),
            Self::NextMatches(_) => f.write_str("expect_next_matches(..)"),
            Self::ConsumeNext(_) => f.write_str("consume_next_with(..)"),
            Self::NextSequence { values, .. } => write!(f, "expect_next_sequence({values:?})"),
            Self::NextCount(n) => write!(f, "expect_next_count({n})"),
            Self::Complete => f.write_str("expect_complete()"),
            Self::Error(ErrorCheck::Any) => f.write_str("expect_error()"),
            Self::Error(ErrorCheck::Kind { name, .. }) => write!(f, "expect_error_of::<{name}>()"),
            Self::Error(ErrorCheck::Message(message)) => {
                write!(f, "expect_error_message({message:?})")
            }
            Self::Error(ErrorCheck::Matches(_)) => f.write_str("expect_error_matches(..)"),
            Self::Error(ErrorCheck::Consume(_)) => f.write_str("consume_error_with(..)"),
            Self::Request(n) => write!(f, "then_request({n})"),
            Self::Cancel => f.write_str("then_cancel()"),
            Self::Await(duration) => write!(f, "then_await({duration:?})"),
            Self::Run(_) => f.write_str("then(..)"),
            Self::RecordWith(_) => f.write_str("record_with(..)"),
            Self::Recorded(RecordedCheck::Matches(_)) => f.write_str("expect_recorded_matches(..)"),
            Self::Recorded(RecordedCheck::Consume(_)) => f.write_str("consume_recorded_with(..)"),
        }
    }
}

impl ErrorCheck {
    /// Checks an observed error against this step.
    pub(crate) fn check(&self, step: &str, error: &SignalError) -> Result<()> {
        match self {
            Self::Any => Ok(()),
            Self::Kind { name, is } => {
                if is(error) {
                    Ok(())
                } else {
                    Err(Error::mismatch(
                        step,
                        format!("an error of type {name}"),
                        format!("{error:?}"),
                    ))
                }
            }
            Self::Message(expected) => {
                let actual = error.to_string();
                if &actual == expected {
                    Ok(())
                } else {
                    Err(Error::mismatch(
                        step,
                        format!("error message {expected:?}"),
                        format!("error message {actual:?}"),
                    ))
                }
            }
            Self::Matches(predicate) => {
                if guarded(|| predicate(error))? {
                    Ok(())
                } else {
                    Err(Error::mismatch(
                        step,
                        "an error matching the predicate",
                        format!("{error:?}"),
                    ))
                }
            }
            Self::Consume(inspect) => guarded(|| inspect(error)),
        }
    }
}

impl<T: Debug> RecordedCheck<T> {
    pub(crate) fn check(&self, step: &str, recorded: &[T]) -> Result<()> {
        match self {
            Self::Matches(predicate) => {
                if guarded(|| predicate(recorded))? {
                    Ok(())
                } else {
                    Err(Error::mismatch(
                        step,
                        "recorded values matching the predicate",
                        format!("{recorded:?}"),
                    ))
                }
            }
            Self::Consume(inspect) => guarded(|| inspect(recorded)),
        }
    }
}

/// Runs user code, turning a panic into [`Error::Action`] with the panic
/// message preserved exactly.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Error::Action(panic_message(&*payload)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "user action panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_step_descriptions() {
        let step: Step<&str> = Step::NextEquals {
            expected: "foo",
            eq: PartialEq::eq,
        };
        assert_eq!(step.to_string(), "expect_next(\"foo\")");
        assert_eq!(step.kind(), StepKind::Value);

        let step: Step<&str> = Step::Fusion {
            requested: FusionMode::ANY,
            expected: Some(FusionMode::ASYNC),
        };
        assert_eq!(step.to_string(), "expect_fusion_modes(SYNC|ASYNC, ASYNC)");
        assert_eq!(step.kind(), StepKind::Subscription);

        let step: Step<&str> = Step::Cancel;
        assert_eq!(step.kind(), StepKind::Cancel);
        assert_eq!(step.expectation(), "no signal");
    }

    #[test]
    fn test_vacuous_steps() {
        assert!(Step::<i32>::NextCount(0).is_vacuous());
        assert!(!Step::<i32>::NextCount(1).is_vacuous());
        let empty: Step<i32> = Step::NextSequence {
            values: Vec::new(),
            eq: PartialEq::eq,
        };
        assert!(empty.is_vacuous());
    }

    #[test]
    fn test_error_kind_check() {
        let check = ErrorCheck::Kind {
            name: "std::io::Error",
            is: is_error_kind::<io::Error>,
        };
        let io_error: Box<SignalError> = Box::new(io::Error::new(io::ErrorKind::Other, "io"));
        assert!(check.check("step", &*io_error).is_ok());

        let fmt_error: Box<SignalError> = Box::new(fmt::Error);
        let err = check.check("step", &*fmt_error).unwrap_err();
        assert!(err.is_mismatch());
        assert!(err.to_string().contains("std::io::Error"));
    }

    #[test]
    fn test_error_message_check() {
        let check = ErrorCheck::Message("Error message".to_string());
        let error: Box<SignalError> = "Error message".into();
        assert!(check.check("step", &*error).is_ok());

        let other: Box<SignalError> = "Other message".into();
        let err = check.check("step", &*other).unwrap_err();
        assert!(err.to_string().contains("\"Other message\""));
    }

    #[test]
    fn test_user_code_steps_run_by_inspection() {
        let predicate: Step<i32> = Step::NextMatches(Arc::new(|value: &i32| *value > 1));
        assert!(predicate.runs_user_code(&Signal::Next(1)));
        assert!(!predicate.runs_user_code(&Signal::Complete));
        assert!(!Step::<i32>::NextCount(1).runs_user_code(&Signal::Next(1)));

        assert!(predicate.inspect(&Signal::Next(2), 1).is_ok());
        let err = predicate.inspect(&Signal::Next(0), 3).unwrap_err();
        assert!(err.to_string().contains("0 (onNext #3)"));

        let consume: Step<i32> = Step::Error(ErrorCheck::Consume(Arc::new(|error: &SignalError| {
            panic!("saw {error}");
        })));
        let signal: Signal<i32> = Signal::Error("boom".into());
        assert!(consume.runs_user_code(&signal));
        assert_eq!(
            consume.inspect(&signal, 0).unwrap_err(),
            Error::Action("saw boom".to_string())
        );
    }

    #[test]
    fn test_guarded_keeps_panic_message() {
        let err = guarded(|| panic!("e:bar")).unwrap_err();
        assert_eq!(err, Error::Action("e:bar".to_string()));

        let value = 7;
        let err = guarded(|| panic!("formatted {value}")).unwrap_err();
        assert_eq!(err.to_string(), "formatted 7");

        assert_eq!(guarded(|| 42).unwrap(), 42);
    }
}
