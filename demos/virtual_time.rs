//! Example: Verifying time-driven publishers
//!
//! This example shows how `StepVerifier::with_virtual_time` binds a
//! `VirtualClock` to a publisher so that hours or days of delay are verified
//! instantly.

use std::time::Duration;

use stepverify::prelude::*;

const HOUR: Duration = Duration::from_secs(3_600);
const DAY: Duration = Duration::from_secs(86_400);

fn main() {
    println!("stepverify - Virtual Time Examples\n");

    example_delayed_elements();
    example_daily_interval();
    example_timeout();

    println!("\nAll virtual time examples completed!");
}

/// Two values, one hour apart
fn example_delayed_elements() {
    println!("Example 1: Delayed elements");

    let elapsed = StepVerifier::with_virtual_time(|clock| {
        source::delay_elements(clock.clone(), HOUR, ["foo", "bar"])
    })
    .expect_subscription()
    .then_await(HOUR)
    .expect_next("foo")
    .then_await(HOUR)
    .expect_next("bar")
    .expect_complete()
    .verify();

    println!("   Two hours verified in {elapsed:?}\n");
}

/// An interval ticking once a day
fn example_daily_interval() {
    println!("Example 2: Daily interval");

    let elapsed = StepVerifier::with_virtual_time(|clock| source::interval(clock.clone(), DAY))
        .expect_subscription()
        .then_await(2 * DAY)
        .expect_next_values([0, 1])
        .then_cancel()
        .verify();

    println!("   Two days verified in {elapsed:?}\n");
}

/// A publisher that never emits fails with a timeout
fn example_timeout() {
    println!("Example 3: Timeout");

    let verdict = StepVerifier::create(source::never::<u32>())
        .expect_next(1)
        .expect_complete()
        .try_verify_timeout(Duration::from_millis(100));

    match verdict {
        Err(error) if error.is_timeout() => println!("   Failed as expected: {error}"),
        other => println!("   Unexpected verdict: {other:?}"),
    }
}
