//! Scripted verification of publishers.
//!
//! A program is declared with [`StepVerifier`] and the [`Steps`] builder, then
//! run with one of the `verify` methods on [`Verification`]. Each run
//! subscribes once, requests the configured initial demand and walks the
//! program step by step:
//!
//! - value and terminal steps consume the matching signal,
//! - request, await, record and action steps run on the verifying thread
//!   between signals,
//! - `then_cancel` cancels the subscription as soon as it is reached.
//!
//! Every signal is also checked against the protocol. A value without
//! demand, a signal after a terminal one, or a second subscription fails the
//! run with [`Error::ProtocolViolation`](crate::Error::ProtocolViolation).
//!
//! # Example
//!
//! ```rust
//! use stepverify::source;
//! use stepverify::verifier::StepVerifier;
//!
//! StepVerifier::create(source::just(["foo", "bar"]))
//!     .expect_next("foo")
//!     .expect_next("bar")
//!     .expect_complete()
//!     .verify();
//! ```
//!
//! # Virtual time
//!
//! ```rust
//! use std::time::Duration;
//! use stepverify::source;
//! use stepverify::verifier::StepVerifier;
//!
//! StepVerifier::with_virtual_time(|clock| {
//!     source::delay_elements(clock.clone(), Duration::from_secs(3600), ["a", "b"])
//! })
//! .then_await(Duration::from_secs(3600))
//! .expect_next("a")
//! .then_await(Duration::from_secs(3600))
//! .expect_next("b")
//! .expect_complete()
//! .verify();
//! ```

mod builder;
mod engine;
mod options;
mod run;
mod step;

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

pub use builder::{Steps, Verification};
pub use options::StepVerifierOptions;
pub use step::SignalError;

use builder::Source;
use crate::clock::VirtualClock;
use crate::protocol::Publisher;

/// Entry points for declaring a verification program.
#[derive(Debug, Clone, Copy)]
pub struct StepVerifier;

impl StepVerifier {
    /// Verifies `publisher`, subscribing to it again on every run.
    pub fn create<T, P>(publisher: P) -> Steps<T>
    where
        T: Debug + Send + Sync + 'static,
        P: Publisher<T> + 'static,
    {
        Self::create_with_options(publisher, StepVerifierOptions::default())
    }

    /// Verifies `publisher`, requesting only `n` values up front.
    pub fn create_with_request<T, P>(publisher: P, n: u64) -> Steps<T>
    where
        T: Debug + Send + Sync + 'static,
        P: Publisher<T> + 'static,
    {
        Self::create_with_options(publisher, StepVerifierOptions::new().initial_request(n))
    }

    /// Verifies `publisher` with explicit options.
    pub fn create_with_options<T, P>(publisher: P, options: StepVerifierOptions) -> Steps<T>
    where
        T: Debug + Send + Sync + 'static,
        P: Publisher<T> + 'static,
    {
        Steps::new(Source::Shared(Arc::new(publisher)), options)
    }

    /// Verifies a fresh publisher from `factory` on every run.
    pub fn from_factory<T, P, F>(factory: F) -> Steps<T>
    where
        T: Debug + Send + Sync + 'static,
        P: Publisher<T> + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        Steps::new(
            Source::Factory(Arc::new(move || Arc::new(factory()) as Arc<dyn Publisher<T>>)),
            StepVerifierOptions::default(),
        )
    }

    /// Verifies a publisher built against a fresh [`VirtualClock`] on every
    /// run. `then_await` steps advance that clock.
    pub fn with_virtual_time<T, P, F>(factory: F) -> Steps<T>
    where
        T: Debug + Send + Sync + 'static,
        P: Publisher<T> + 'static,
        F: Fn(&VirtualClock) -> P + Send + Sync + 'static,
    {
        Self::with_virtual_time_options(factory, StepVerifierOptions::default())
    }

    /// Like [`with_virtual_time`](Self::with_virtual_time), with explicit
    /// options. A clock set in `options` is reused across runs instead of
    /// creating a fresh one.
    pub fn with_virtual_time_options<T, P, F>(factory: F, options: StepVerifierOptions) -> Steps<T>
    where
        T: Debug + Send + Sync + 'static,
        P: Publisher<T> + 'static,
        F: Fn(&VirtualClock) -> P + Send + Sync + 'static,
    {
        Steps::new(
            Source::VirtualTime(Arc::new(move |clock: &VirtualClock| {
                Arc::new(factory(clock)) as Arc<dyn Publisher<T>>
            })),
            options,
        )
    }

    /// Verifies a publisher that can be subscribed only once. Verifying the
    /// resulting program a second time fails with
    /// [`Error::Usage`](crate::Error::Usage).
    pub fn create_once<T, P>(publisher: P) -> Steps<T>
    where
        T: Debug + Send + Sync + 'static,
        P: Publisher<T> + 'static,
    {
        Steps::new(
            Source::Once(Mutex::new(Some(Arc::new(publisher) as Arc<dyn Publisher<T>>))),
            StepVerifierOptions::default(),
        )
    }
}
