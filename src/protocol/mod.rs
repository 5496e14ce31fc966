//! The push/pull backpressure protocol spoken between publishers and the verifier.
//!
//! A [`Publisher`] hands each [`Subscriber`] exactly one [`Subscription`]
//! through `on_subscribe`. The subscriber advertises demand with
//! [`Subscription::request`]; the publisher answers with at most that many
//! `on_next` calls followed by at most one of `on_error` / `on_complete`.
//!
//! A subscription may additionally expose a [`QueueSubscription`], letting the
//! consumer negotiate a [`FusionMode`] and pull values with `poll` instead of
//! having them pushed.
//!
//! # Example
//!
//! A publisher that emits a single value on the first request:
//!
//! ```rust
//! use std::sync::Arc;
//! use stepverify::protocol::{Publisher, Subscriber, Subscription};
//!
//! struct One;
//!
//! struct OneSubscription(Arc<dyn Subscriber<u32>>);
//!
//! impl Subscription<u32> for OneSubscription {
//!     fn request(&self, _n: u64) {
//!         self.0.on_next(1);
//!         self.0.on_complete();
//!     }
//!
//!     fn cancel(&self) {}
//! }
//!
//! impl Publisher<u32> for One {
//!     fn subscribe(&self, subscriber: Arc<dyn Subscriber<u32>>) {
//!         subscriber.on_subscribe(Arc::new(OneSubscription(Arc::clone(&subscriber))));
//!     }
//! }
//! ```

mod fusion;

use std::fmt;
use std::sync::Arc;

pub use fusion::FusionMode;

/// Error type carried by `on_error`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Demand value meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

/// Adds `n` to an outstanding demand, saturating at [`UNBOUNDED`].
///
/// ```rust
/// use stepverify::protocol::{add_demand, UNBOUNDED};
///
/// assert_eq!(add_demand(2, 3), 5);
/// assert_eq!(add_demand(UNBOUNDED - 1, 5), UNBOUNDED);
/// ```
#[must_use]
pub fn add_demand(current: u64, n: u64) -> u64 {
    current.saturating_add(n)
}

/// Removes one unit from an outstanding demand; unbounded demand stays unbounded.
#[must_use]
pub fn consume_demand(current: u64) -> u64 {
    if current == UNBOUNDED {
        UNBOUNDED
    } else {
        current.saturating_sub(1)
    }
}

/// The link between one publisher and one subscriber.
pub trait Subscription<T>: Send + Sync {
    /// Advertises `n` more values of demand. Demand is cumulative.
    fn request(&self, n: u64);

    /// Stops the flow of signals. Must be idempotent.
    fn cancel(&self);

    /// Returns the pull-based queue view of this subscription, if it has one.
    fn as_queue(&self) -> Option<&dyn QueueSubscription<T>> {
        None
    }
}

/// Pull-based view of a subscription used for fusion.
pub trait QueueSubscription<T>: Send + Sync {
    /// Negotiates a fusion mode. Returns the granted mode, or
    /// [`FusionMode::NONE`] to keep push delivery.
    fn request_fusion(&self, requested: FusionMode) -> FusionMode;

    /// Pulls one value. `Ok(None)` means empty (and, in SYNC mode, completed).
    ///
    /// # Errors
    ///
    /// Returns the upstream error when producing the value failed.
    fn poll(&self) -> Result<Option<T>, BoxError>;

    /// Number of values ready to be pulled.
    fn size(&self) -> usize;

    /// Returns `true` if no value is ready.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drops every queued value.
    fn clear(&self);
}

/// The receiving side of the protocol.
pub trait Subscriber<T>: Send + Sync {
    /// Receives the subscription. Called exactly once, before anything else.
    fn on_subscribe(&self, subscription: Arc<dyn Subscription<T>>);

    /// Receives one value.
    fn on_next(&self, value: T);

    /// Receives the terminal error.
    fn on_error(&self, error: BoxError);

    /// Receives the terminal completion.
    fn on_complete(&self);

    /// Called by an ASYNC-fused producer when values are ready to be polled.
    fn on_queue_ready(&self) {}
}

/// A source of values that honors the backpressure protocol.
pub trait Publisher<T>: Send + Sync {
    /// Connects `subscriber`; it will receive `on_subscribe` exactly once.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

impl<T, P> Publisher<T> for Arc<P>
where
    P: Publisher<T> + ?Sized,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (**self).subscribe(subscriber);
    }
}

impl<T, P> Publisher<T> for Box<P>
where
    P: Publisher<T> + ?Sized,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (**self).subscribe(subscriber);
    }
}

/// A data-carrying signal observed after subscription.
pub enum Signal<T> {
    /// One value.
    Next(T),
    /// Terminal error.
    Error(BoxError),
    /// Terminal completion.
    Complete,
}

impl<T> Signal<T> {
    /// Returns `true` for `Error` and `Complete`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next(value) => write!(f, "onNext({value:?})"),
            Self::Error(error) => write!(f, "onError({error})"),
            Self::Complete => f.write_str("onComplete()"),
        }
    }
}
