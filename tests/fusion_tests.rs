//! Fusion negotiation against SYNC, ASYNC and hidden sources.

mod common;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::init_test_logging;
use parking_lot::Mutex;
use stepverify::prelude::*;
use stepverify::protocol::{BoxError, QueueSubscription};

/// ASYNC-only source whose producer finishes while the consumer polls: the
/// first empty poll enqueues a last value and completes before returning.
struct LateTail;

struct LateTailQueue {
    subscriber: Arc<dyn Subscriber<i32>>,
    queue: Mutex<VecDeque<i32>>,
    finished: AtomicBool,
}

impl Publisher<i32> for LateTail {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<i32>>) {
        let subscription = Arc::new(LateTailQueue {
            subscriber: Arc::clone(&subscriber),
            queue: Mutex::new(VecDeque::from([1])),
            finished: AtomicBool::new(false),
        });
        subscriber.on_subscribe(subscription);
        subscriber.on_queue_ready();
    }
}

impl Subscription<i32> for LateTailQueue {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {
        self.queue.lock().clear();
    }

    fn as_queue(&self) -> Option<&dyn QueueSubscription<i32>> {
        Some(self)
    }
}

impl QueueSubscription<i32> for LateTailQueue {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.contains(FusionMode::ASYNC) {
            FusionMode::ASYNC
        } else {
            FusionMode::NONE
        }
    }

    fn poll(&self) -> std::result::Result<Option<i32>, BoxError> {
        let value = self.queue.lock().pop_front();
        if value.is_none() && !self.finished.swap(true, Ordering::SeqCst) {
            self.queue.lock().push_back(2);
            self.subscriber.on_queue_ready();
            self.subscriber.on_complete();
        }
        Ok(value)
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }
}

#[test]
fn test_sync_fusion_pulls_values() {
    init_test_logging();
    StepVerifier::create(source::range(1, 3))
        .expect_fusion_modes(FusionMode::ANY, FusionMode::SYNC)
        .expect_next_values([1, 2, 3])
        .expect_complete()
        .verify();
}

#[test]
fn test_sync_fusion_counts_and_errors() {
    StepVerifier::create(source::range(0, 10_000))
        .expect_fusion()
        .expect_next_count(10_000)
        .expect_complete()
        .verify();

    StepVerifier::create(source::concat_error(vec![1_u32], "boom"))
        .expect_fusion_mode(FusionMode::SYNC)
        .expect_next(1)
        .expect_error_message("boom")
        .verify();
}

#[test]
fn test_sync_fusion_with_zero_initial_request() {
    StepVerifier::create_with_request(source::range(0, 2), 0)
        .expect_fusion_modes(FusionMode::SYNC, FusionMode::SYNC)
        .expect_next_values([0, 1])
        .expect_complete()
        .verify();
}

#[test]
fn test_sync_fusion_then_cancel() {
    StepVerifier::create(source::range(0, 100))
        .expect_fusion()
        .expect_next_values([0, 1])
        .then_cancel()
        .verify();
}

#[test]
fn test_granted_mode_must_match_expected() {
    let error = StepVerifier::create(source::range(1, 3))
        .expect_fusion_modes(FusionMode::ANY, FusionMode::ASYNC)
        .expect_next_count(3)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
    let message = error.to_string();
    assert!(message.contains("ASYNC"), "{message}");
    assert!(message.contains("SYNC"), "{message}");
}

#[test]
fn test_refused_fusion_fails() {
    let error = StepVerifier::create(source::range(1, 3))
        .expect_fusion_mode(FusionMode::ASYNC)
        .expect_next_count(3)
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
}

#[test]
fn test_async_fusion_across_threads() {
    init_test_logging();
    StepVerifier::create(source::publish_on_thread(source::range(0, 100)))
        .expect_fusion_modes(FusionMode::ANY, FusionMode::ASYNC)
        .expect_next_count(99)
        .expect_next(99)
        .expect_complete()
        .verify_timeout(Duration::from_secs(5));
}

#[test]
fn test_async_fusion_with_batched_demand() {
    StepVerifier::create_with_request(source::publish_on_thread(source::range(0, 10)), 0)
        .expect_fusion_mode(FusionMode::ASYNC)
        .then_request(4)
        .expect_next_values([0, 1, 2, 3])
        .then_request(6)
        .expect_next_count(6)
        .expect_complete()
        .verify_timeout(Duration::from_secs(5));
}

#[test]
fn test_no_fusion_on_hidden_source() {
    StepVerifier::create(source::hide(source::range(0, 2)))
        .expect_no_fusion()
        .expect_next_values([0, 1])
        .expect_complete()
        .verify();
}

#[test]
fn test_no_fusion_fails_when_granted() {
    let error = StepVerifier::create(source::range(0, 2))
        .expect_no_fusion()
        .expect_next_values([0, 1])
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
    assert!(error.to_string().contains("no fusion"));
}

#[test]
fn test_fusion_on_hidden_source_fails() {
    let error = StepVerifier::create(source::hide(source::range(0, 2)))
        .expect_fusion()
        .expect_next_values([0, 1])
        .expect_complete()
        .try_verify()
        .unwrap_err();
    assert!(error.is_mismatch());
    assert!(error.to_string().contains("without queue support"));
}

#[test]
fn test_async_terminal_arriving_during_empty_poll_trails_queued_values() {
    init_test_logging();
    StepVerifier::create(LateTail)
        .expect_fusion_modes(FusionMode::ASYNC, FusionMode::ASYNC)
        .expect_next(1)
        .expect_next(2)
        .expect_complete()
        .verify_timeout(Duration::from_secs(1));
}
