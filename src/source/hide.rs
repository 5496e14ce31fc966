//! Hides queue support of another source.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::protocol::{BoxError, Publisher, Subscriber, Subscription};

/// Relays another source's signals through a subscription without queue
/// support, so fusion is never granted.
pub struct Hide<P, T> {
    source: P,
    _marker: PhantomData<fn() -> T>,
}

/// Wraps `source` in a [`Hide`].
pub fn hide<P, T>(source: P) -> Hide<P, T>
where
    P: Publisher<T>,
{
    Hide {
        source,
        _marker: PhantomData,
    }
}

impl<P, T> Publisher<T> for Hide<P, T>
where
    P: Publisher<T>,
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(Arc::new(Relay { subscriber }));
    }
}

struct Relay<T> {
    subscriber: Arc<dyn Subscriber<T>>,
}

impl<T: Send + 'static> Subscriber<T> for Relay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription<T>>) {
        self.subscriber.on_subscribe(Arc::new(Hidden(subscription)));
    }

    fn on_next(&self, value: T) {
        self.subscriber.on_next(value);
    }

    fn on_error(&self, error: BoxError) {
        self.subscriber.on_error(error);
    }

    fn on_complete(&self) {
        self.subscriber.on_complete();
    }
}

struct Hidden<T>(Arc<dyn Subscription<T>>);

impl<T> Subscription<T> for Hidden<T> {
    fn request(&self, n: u64) {
        self.0.request(n);
    }

    fn cancel(&self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{range, testing::Collect};

    #[test]
    fn test_relays_signals() {
        let collect = Arc::new(Collect::<u64>::default());
        hide(range(5, 2)).subscribe(collect.clone());
        collect.request(crate::protocol::UNBOUNDED);
        assert_eq!(collect.events(), vec!["5", "6", "complete"]);
    }

    #[test]
    fn test_has_no_queue() {
        let collect = Arc::new(Collect::<u64>::default());
        hide(range(0, 3)).subscribe(collect.clone());
        let subscription = collect.subscription().unwrap();
        assert!(subscription.as_queue().is_none());
    }
}
