//! Integration tests for expectation programs against reference sources.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{init_test_logging, Scripted};
use stepverify::prelude::*;

#[derive(Debug, Clone, thiserror::Error)]
#[error("quota exceeded")]
struct QuotaExceeded;

#[test]
fn test_values_then_complete() {
    init_test_logging();
    StepVerifier::create(source::just(["foo", "bar"]))
        .expect_next("foo")
        .expect_next("bar")
        .expect_complete()
        .verify();
}

#[test]
fn test_mismatching_value_is_reported() {
    init_test_logging();
    let error = StepVerifier::create(source::just(["foo", "bar"]))
        .expect_next("foo")
        .expect_next("baz")
        .expect_complete()
        .try_verify()
        .unwrap_err();

    assert!(error.is_mismatch());
    let message = error.to_string();
    assert!(message.contains("expect_next(\"baz\")"), "{message}");
    assert!(message.contains("\"bar\" (onNext #2)"), "{message}");
}

#[test]
#[should_panic(expected = "expect_next(\"baz\")")]
fn test_verify_panics_on_mismatch() {
    StepVerifier::create(source::just(["foo", "bar"]))
        .expect_next("foo")
        .expect_next("baz")
        .expect_complete()
        .verify();
}

#[test]
fn test_extra_value_fails_at_completion_step() {
    let error = StepVerifier::create(source::just(["foo", "bar"]))
        .expect_next("foo")
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
    assert!(error.to_string().contains("expect_complete()"));
}

#[test]
fn test_early_completion_reports_pending_steps() {
    let error = StepVerifier::create(source::just(["foo"]))
        .expect_next("foo")
        .expect_next("bar")
        .expect_next("baz")
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.to_string().contains("unexpected completion, 3 step(s) still pending"));
}

#[test]
fn test_predicates_and_consumers() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    StepVerifier::create(source::range(1, 3))
        .expect_next_matches(|value| value % 2 == 1)
        .consume_next_with(move |value| {
            assert_eq!(*value, 2);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect_next_sequence([3])
        .expect_complete()
        .verify();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_consumer_failure_is_kept_verbatim() {
    let error = StepVerifier::create(source::just(["foo", "bar"]))
        .consume_next_with(|value| assert_eq!(*value, "foo"))
        .consume_next_with(|value| {
            if *value == "bar" {
                panic!("e:{value}");
            }
        })
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert_eq!(error, Error::Action("e:bar".to_string()));
    assert_eq!(error.to_string(), "e:bar");
}

#[test]
fn test_rejected_predicate_fails() {
    let error = StepVerifier::create(source::range(0, 2))
        .expect_next_matches(|value| *value > 10)
        .expect_next_count(1)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
    assert!(error.to_string().contains("0 (onNext #1)"));
}

#[test]
fn test_counting_a_million_values() {
    StepVerifier::create(source::range(0, 1_000_000))
        .expect_next_count(1_000_000)
        .expect_complete()
        .verify();
}

#[test]
fn test_count_of_zero_is_vacuous() {
    StepVerifier::create(source::range(5, 1))
        .expect_next_count(0)
        .expect_next(5)
        .expect_complete()
        .verify();
}

#[test]
fn test_batched_demand() {
    init_test_logging_quiet();
    StepVerifier::create_with_request(source::range(0, 1_000_000), 0)
        .then_request(100_000)
        .expect_next_count(100_000)
        .then_request(500_000)
        .expect_next_count(500_000)
        .then_request(400_000)
        .expect_next_count(400_000)
        .expect_complete()
        .verify();
}

#[test]
fn test_batched_demand_short_by_one_fails() {
    init_test_logging_quiet();
    let error = StepVerifier::create_with_request(source::range(0, 1_000_000), 0)
        .then_request(100_000)
        .expect_next_count(99_999)
        .then_request(500_000)
        .expect_next_count(500_000)
        .then_request(400_000)
        .expect_next_count(400_000)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch(), "{error}");
}

fn init_test_logging_quiet() {
    common::init_test_logging_with_level(tracing::Level::INFO);
}

#[test]
fn test_error_expectations() {
    StepVerifier::create(source::concat_error(vec![1_u32], "boom"))
        .expect_next(1)
        .expect_error_message("boom")
        .verify();

    StepVerifier::create(source::error::<u32, _>("boom"))
        .expect_error()
        .verify();

    StepVerifier::create(source::error::<u32, _>(QuotaExceeded))
        .expect_error_of::<QuotaExceeded>()
        .verify();

    StepVerifier::create(source::error::<u32, _>("boom"))
        .expect_error_matches(|error| error.to_string().len() == 4)
        .verify();
}

#[test]
fn test_wrong_error_kind_fails() {
    let error = StepVerifier::create(source::error::<u32, _>("boom"))
        .expect_error_of::<QuotaExceeded>()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
    assert!(error.to_string().contains("QuotaExceeded"));
}

#[test]
fn test_error_instead_of_completion() {
    let error = StepVerifier::create(source::concat_error(vec![1_u32], "boom"))
        .expect_next(1)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.to_string().contains("unexpected error"));
}

#[test]
fn test_consume_error_with() {
    let message = Arc::new(parking_lot::Mutex::new(String::new()));
    let sink = Arc::clone(&message);
    StepVerifier::create(source::error::<u32, _>("disk full"))
        .consume_error_with(move |error| *sink.lock() = error.to_string())
        .verify();
    assert_eq!(*message.lock(), "disk full");
}

#[test]
fn test_cancel_mid_stream() {
    StepVerifier::create(source::range(0, 1_000))
        .expect_next_values([0, 1, 2])
        .then_cancel()
        .verify();
}

#[test]
fn test_cancel_before_subscription_values() {
    StepVerifier::create(source::never::<u32>())
        .expect_subscription()
        .then_cancel()
        .verify();
}

#[test]
fn test_then_runs_between_signals() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let observed = Arc::clone(&ran);
    StepVerifier::create_with_request(source::range(0, 2), 1)
        .expect_next(0)
        .then(move || flag.store(true, Ordering::SeqCst))
        .then_request(1)
        .expect_next_matches(move |_| observed.load(Ordering::SeqCst))
        .expect_complete()
        .verify();
}

#[test]
fn test_failing_action_aborts_the_run() {
    let error = StepVerifier::create(source::range(0, 2))
        .expect_next(0)
        .then(|| panic!("action failed"))
        .expect_next(1)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert_eq!(error.to_string(), "action failed");
}

#[test]
fn test_recording() {
    StepVerifier::create(source::range(1, 3))
        .record_with(Vec::new)
        .expect_next_count(3)
        .expect_recorded_matches(|recorded| recorded == [1, 2, 3])
        .expect_complete()
        .verify();

    let error = StepVerifier::create(source::range(1, 3))
        .record_with(Vec::new)
        .expect_next_count(3)
        .expect_recorded_matches(|recorded| recorded.is_empty())
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
}

#[test]
fn test_recorded_without_recorder_fails() {
    let error = StepVerifier::create(source::range(1, 1))
        .expect_next(1)
        .consume_recorded_with(|_| {})
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.to_string().contains("no recorder installed"));
}

#[test]
fn test_subscription_checks() {
    StepVerifier::create(source::range(0, 1))
        .expect_subscription_matches(|subscription| subscription.as_queue().is_some())
        .expect_next(0)
        .expect_complete()
        .verify();

    let error = StepVerifier::create(source::hide(source::range(0, 1)))
        .expect_subscription_matches(|subscription| subscription.as_queue().is_some())
        .expect_next(0)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
}

#[test]
fn test_subscription_consumer_sees_the_subscription() {
    let saw_queue = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_queue);
    StepVerifier::create(source::range(0, 1))
        .consume_subscription_with(move |subscription| {
            flag.store(subscription.as_queue().is_some(), Ordering::SeqCst);
        })
        .expect_next(0)
        .expect_complete()
        .verify();
    assert!(saw_queue.load(Ordering::SeqCst));
}

#[test]
fn test_subscription_consumer_may_request() {
    let elapsed = StepVerifier::create_with_request(source::range(0, 3), 0)
        .consume_subscription_with(|subscription| subscription.request(3))
        .expect_next_count(3)
        .expect_complete()
        .try_verify_timeout(Duration::from_secs(1));
    assert!(elapsed.is_ok(), "{elapsed:?}");
}

#[test]
fn test_subscription_consumer_may_cancel() {
    StepVerifier::create(source::never::<u32>())
        .consume_subscription_with(|subscription| subscription.cancel())
        .then_cancel()
        .verify_timeout(Duration::from_secs(1));
}

#[test]
fn test_double_subscription_is_a_protocol_violation() {
    let error = StepVerifier::create(Scripted {
        subscriptions: 2,
        values: vec![],
        completions: 1,
    })
    .expect_complete()
    .try_verify()
    .unwrap_err();
    assert!(error.is_protocol_violation());
    assert!(error.to_string().contains("more than once"));
}

#[test]
fn test_overflow_is_a_protocol_violation() {
    let error = StepVerifier::create_with_request(Scripted::values(vec![1, 2]), 1)
        .expect_next(1)
        .expect_next(2)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_protocol_violation());
    assert!(error.to_string().contains("without outstanding demand"));
}

#[test]
fn test_signal_after_completion_is_a_protocol_violation() {
    let error = StepVerifier::create(Scripted {
        subscriptions: 1,
        values: vec![1],
        completions: 2,
    })
    .expect_next(1)
    .expect_complete()
    .try_verify()
    .unwrap_err();
    assert!(error.is_protocol_violation());
    assert!(error.to_string().contains("after a terminal signal"));
}

#[test]
fn test_declaration_is_reusable() {
    let verification = StepVerifier::create(source::range(0, 3))
        .expect_next_values([0, 1, 2])
        .expect_complete();
    verification.verify();
    verification.verify();
}

#[test]
fn test_factory_builds_a_fresh_source_per_run() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let verification = StepVerifier::from_factory(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        source::just(vec!["a"])
    })
    .expect_next("a")
    .expect_complete();

    verification.verify();
    verification.verify();
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[test]
fn test_once_source_cannot_be_verified_twice() {
    let verification = StepVerifier::create_once(source::just(vec![1_u8]))
        .expect_next(1)
        .expect_complete();
    verification.verify();

    let error = verification.try_verify().unwrap_err();
    assert!(matches!(error, Error::Usage(_)));
}

#[test]
fn test_scenario_name_prefixes_failures() {
    let verification = StepVerifier::create_with_options(
        source::just(["x"]),
        StepVerifierOptions::new().scenario_name("greeting"),
    )
    .expect_next("y")
    .expect_complete();

    let panic = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| verification.verify()))
        .unwrap_err();
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(message.starts_with("[greeting] "), "{message}");
}

#[test]
fn test_scenario_name_leaves_user_panics_verbatim() {
    let verification = StepVerifier::create_with_options(
        source::just(["foo", "bar"]),
        StepVerifierOptions::new().scenario_name("greeting"),
    )
    .expect_next("foo")
    .consume_next_with(|value| panic!("e:{value}"))
    .expect_complete();

    let panic = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| verification.verify()))
        .unwrap_err();
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert_eq!(message, "e:bar");
}

#[test]
fn test_values_from_another_thread() {
    StepVerifier::create(source::publish_on_thread(source::range(0, 100)).thread_name("emitter"))
        .consume_next_with(|_| assert_eq!(thread::current().name(), Some("emitter")))
        .expect_next_count(98)
        .expect_next(99)
        .expect_complete()
        .verify_timeout(Duration::from_secs(5));
}

#[test]
fn test_stream_source_honors_demand() {
    StepVerifier::create_with_request(
        source::from_stream(|| futures::stream::iter(vec![1_u32, 2, 3])),
        1,
    )
    .expect_next(1)
    .then_request(2)
    .expect_next_values([2, 3])
    .expect_complete()
    .verify_timeout(Duration::from_secs(5));
}
