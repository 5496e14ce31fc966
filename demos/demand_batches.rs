//! Example: Driving demand step by step
//!
//! This example requests values from a million-element source in batches and
//! counts them without keeping them, then shows how a short batch is
//! reported.

use stepverify::prelude::*;

fn main() {
    println!("stepverify - Demand Batch Examples\n");

    example_batches();
    example_short_batch();
    example_fusion();

    println!("\nAll demand examples completed!");
}

fn example_batches() {
    println!("Example 1: Batched requests");

    let elapsed = StepVerifier::create_with_request(source::range(0, 1_000_000), 0)
        .then_request(100_000)
        .expect_next_count(100_000)
        .then_request(500_000)
        .expect_next_count(500_000)
        .then_request(400_000)
        .expect_next_count(400_000)
        .expect_complete()
        .verify();

    println!("   1,000,000 values counted in {elapsed:?}\n");
}

fn example_short_batch() {
    println!("Example 2: A batch that is one short");

    let verdict = StepVerifier::create_with_request(source::range(0, 10), 0)
        .then_request(5)
        .expect_next_count(4)
        .then_request(5)
        .expect_next_count(5)
        .expect_complete()
        .try_verify();

    match verdict {
        Err(error) => println!("   {error}\n"),
        Ok(_) => println!("   Unexpectedly passed\n"),
    }
}

fn example_fusion() {
    println!("Example 3: Pulling through a fused queue");

    StepVerifier::create(source::range(1, 3))
        .expect_fusion_modes(FusionMode::ANY, FusionMode::SYNC)
        .expect_next_values([1, 2, 3])
        .expect_complete()
        .verify();

    println!("   SYNC fusion granted and drained");
}
