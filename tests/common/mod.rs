//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use stepverify::protocol::{Publisher, Subscriber, Subscription};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// A subscription that accepts every request and does nothing.
pub struct Inert;

impl<T> Subscription<T> for Inert {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// A misbehaving publisher that pushes a fixed script of signals straight
/// into the subscriber on subscription, ignoring demand.
pub struct Scripted {
    pub subscriptions: usize,
    pub values: Vec<u32>,
    pub completions: usize,
}

impl Scripted {
    pub fn values(values: Vec<u32>) -> Self {
        Self {
            subscriptions: 1,
            values,
            completions: 1,
        }
    }
}

impl Publisher<u32> for Scripted {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<u32>>) {
        for _ in 0..self.subscriptions {
            subscriber.on_subscribe(Arc::new(Inert));
        }
        for value in &self.values {
            subscriber.on_next(*value);
        }
        for _ in 0..self.completions {
            subscriber.on_complete();
        }
    }
}
