//! Integration tests for retry backoff and stop conditions

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use c0r_reliability::error::ResilienceError;
use c0r_reliability::retry::{RetryConfig, RetryHandler, RetryStrategy};
use c0r_reliability_testing::{ScriptedOperation, TestError};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;
use tokio::time::Instant;

fn exponential(max_attempts: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_secs(1))
        .backoff_multiplier(2.0)
        .max_delay(Duration::from_secs(60))
        .strategy(RetryStrategy::Exponential)
        .jitter(false)
        .build()
}

fn any_strategy() -> impl Strategy<Value = RetryStrategy> {
    prop_oneof![
        Just(RetryStrategy::Fixed),
        Just(RetryStrategy::Exponential),
        Just(RetryStrategy::Linear),
        Just(RetryStrategy::Jittered),
        Just(RetryStrategy::Fibonacci),
    ]
}

#[test]
fn test_exponential_delays_double() {
    let config = exponential(5);
    let mut rng = StdRng::seed_from_u64(7);

    let delays: Vec<Duration> = (1..=3)
        .map(|attempt| config.delay_for_attempt(attempt, &mut rng))
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
}

#[test]
fn test_exponential_delays_are_clamped() {
    let config = RetryConfig::builder()
        .base_delay(Duration::from_secs(1))
        .max_delay(Duration::from_secs(5))
        .jitter(false)
        .build();
    let mut rng = StdRng::seed_from_u64(7);

    assert_eq!(config.delay_for_attempt(3, &mut rng), Duration::from_secs(4));
    assert_eq!(config.delay_for_attempt(4, &mut rng), Duration::from_secs(5));
    assert_eq!(config.delay_for_attempt(30, &mut rng), Duration::from_secs(5));
}

proptest! {
    #[test]
    fn delay_never_exceeds_jittered_cap(
        strategy in any_strategy(),
        attempt in 1u32..64,
        base_ms in 1u64..5_000,
        max_ms in 5_000u64..120_000,
        jitter_range in 0.0f64..=1.0,
        seed in any::<u64>(),
    ) {
        let config = RetryConfig::builder()
            .strategy(strategy)
            .base_delay(Duration::from_millis(base_ms))
            .max_delay(Duration::from_millis(max_ms))
            .jitter(true)
            .jitter_range(jitter_range)
            .build();
        let mut rng = StdRng::seed_from_u64(seed);

        let delay = config.delay_for_attempt(attempt, &mut rng);
        let cap = Duration::from_millis(max_ms).mul_f64(1.0 + jitter_range) + Duration::from_millis(1);
        prop_assert!(delay <= cap, "delay {:?} above cap {:?}", delay, cap);
    }

    #[test]
    fn unjittered_delay_stays_within_max(
        strategy in any_strategy(),
        attempt in 1u32..64,
        base_ms in 1u64..5_000,
        seed in any::<u64>(),
    ) {
        let config = RetryConfig::builder()
            .strategy(strategy)
            .base_delay(Duration::from_millis(base_ms))
            .max_delay(Duration::from_secs(30))
            .jitter(false)
            .build();
        let mut rng = StdRng::seed_from_u64(seed);

        prop_assert!(config.delay_for_attempt(attempt, &mut rng) <= Duration::from_secs(30));
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_is_slept() {
    let handler = RetryHandler::new("vision", exponential(4));
    let provider = ScriptedOperation::new()
        .then_fail_times(3, TestError::transient("429"))
        .then_ok("meal");
    let op = provider.operation::<()>();

    let started = Instant::now();
    let result = handler.execute(|| op(())).await;

    assert_eq!(result.value(), Some(&"meal"));
    assert_eq!(result.attempts_made, 4);
    assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
    let delays: Vec<Option<Duration>> = result.history.iter().map(|a| a.delay_before_next).collect();
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(4)),
            None
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_on_error_aborts_immediately() {
    let handler = RetryHandler::new("vision", exponential(5)).stop_on(TestError::is_fatal);
    let provider = ScriptedOperation::new()
        .then_fail(TestError::transient("503"))
        .then_fail(TestError::fatal("unsupported image format"))
        .then_ok("never");
    let op = provider.operation::<()>();

    let started = Instant::now();
    let result = handler.execute(|| op(())).await;

    assert_eq!(provider.calls(), 2);
    assert_eq!(result.attempts_made, 2);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert_eq!(
        result.error(),
        Some(&ResilienceError::Inner(TestError::fatal("unsupported image format")))
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_if_limits_retries_to_matching_errors() {
    let handler = RetryHandler::new("vision", exponential(5)).retry_if(TestError::is_transient);
    let provider = ScriptedOperation::<u32>::always_fail(TestError::fatal("bad request"));
    let op = provider.operation::<()>();

    let result = handler.execute(|| op(())).await;
    assert_eq!(provider.calls(), 1);
    assert!(!result.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_reports_last_error_and_stats() {
    let handler = RetryHandler::new("vision", exponential(3));
    let provider = ScriptedOperation::<u32>::new()
        .then_fail(TestError::transient("first"))
        .then_fail(TestError::transient("second"))
        .then_fail(TestError::transient("third"));
    let op = provider.operation::<()>();

    let err = handler.call(|| op(())).await.unwrap_err();
    assert_eq!(err, ResilienceError::Inner(TestError::transient("third")));

    let stats = handler.stats();
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.failed_executions, 1);
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats, handler.stats());
}
