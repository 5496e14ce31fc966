//! # stepverify
//!
//! > Step-by-step verification of backpressure-aware publishers
//!
//! **stepverify** subscribes to a [`Publisher`](protocol::Publisher), walks a
//! declared program of expectations against the signals it emits, and fails
//! with a precise [`Error`] as soon as something diverges. Time-driven
//! publishers run against a [`VirtualClock`](clock::VirtualClock), so hours of
//! delay are verified in microseconds.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use stepverify::prelude::*;
//!
//! StepVerifier::create(source::just(["foo", "bar"]))
//!     .expect_next("foo")
//!     .expect_next("bar")
//!     .expect_complete()
//!     .verify();
//!
//! StepVerifier::with_virtual_time(|clock| {
//!     source::interval(clock.clone(), Duration::from_secs(86_400))
//! })
//! .then_await(Duration::from_secs(2 * 86_400))
//! .expect_next_values([0, 1])
//! .then_cancel()
//! .verify();
//! ```
//!
//! ## Features
//!
//! - **Expectation programs** - values, counts, predicates, terminals, recording
//! - **Demand control** - initial request, `then_request` batches, cancellation
//! - **Protocol checks** - overflow, signals after termination, double subscription
//! - **Virtual time** - deterministic scheduling with `then_await`
//! - **Fusion** - SYNC and ASYNC queue negotiation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod error;
pub mod protocol;
pub mod source;
pub mod verifier;

/// Prelude for convenient imports
///
/// ```rust
/// use stepverify::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{Scheduler, VirtualClock, WallClock};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{FusionMode, Publisher, Subscriber, Subscription, UNBOUNDED};
    pub use crate::source;
    pub use crate::verifier::{StepVerifier, StepVerifierOptions};
}

// Re-exports
pub use error::{Error, Result};
