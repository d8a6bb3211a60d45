//! Integration tests for fallback chains across the four strategies

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use c0r_reliability::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use c0r_reliability::error::{FallbackError, ResilienceError};
use c0r_reliability::fallback::{FallbackManager, FallbackStrategy, OptionSpec};
use c0r_reliability_testing::{ScriptedOperation, TestError, init_test_tracing};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type Manager = FallbackManager<String, String, TestError>;

fn manager(strategy: FallbackStrategy) -> Manager {
    FallbackManager::new("meal_analysis", strategy)
}

#[tokio::test]
async fn test_sequential_falls_through_to_second_option() {
    init_test_tracing();
    let primary = ScriptedOperation::<String>::always_fail(TestError::transient("quota exceeded"));
    let secondary = ScriptedOperation::always_ok("B".to_string());

    let manager = manager(FallbackStrategy::Sequential);
    manager
        .add_option(OptionSpec::new("A", primary.operation()))
        .add_option(OptionSpec::new("B", secondary.operation()));

    let result = manager.execute("lunch.jpg".to_string()).await;

    assert!(result.is_success());
    assert_eq!(result.value().map(String::as_str), Some("B"));
    assert_eq!(result.executed_option.as_deref(), Some("B"));
    assert!(result.fallback_used);
    assert_eq!(result.attempts_made, 2);
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_returns_fastest_success() {
    let slow = ScriptedOperation::slow(Duration::from_secs(5), "A".to_string());
    let fast = ScriptedOperation::slow(Duration::from_millis(200), "B".to_string());

    let manager = manager(FallbackStrategy::Parallel);
    manager
        .add_option(OptionSpec::new("A", slow.operation()))
        .add_option(OptionSpec::new("B", fast.operation()));

    let started = Instant::now();
    let result = manager.execute("dinner.jpg".to_string()).await;

    assert_eq!(result.value().map(String::as_str), Some("B"));
    assert_eq!(result.executed_option.as_deref(), Some("B"));
    assert!(!result.fallback_used);
    assert_eq!(result.attempts_made, 2);
    assert_eq!(started.elapsed(), Duration::from_millis(200));

    // The slow option was cancelled, so it never recorded a result.
    let stats = manager.stats();
    let slow_stats = &stats.option_stats[0];
    assert_eq!(slow_stats.invocations, 1);
    assert_eq!(slow_stats.successes + slow_stats.failures, 0);
}

#[tokio::test]
async fn test_parallel_all_failing_is_exhausted() {
    let manager = manager(FallbackStrategy::Parallel);
    manager
        .add_option(OptionSpec::new(
            "A",
            ScriptedOperation::<String>::always_fail(TestError::transient("a")).operation(),
        ))
        .add_option(OptionSpec::new(
            "B",
            ScriptedOperation::<String>::always_fail(TestError::transient("b")).operation(),
        ));

    let result = manager.execute("snack.jpg".to_string()).await;
    assert!(matches!(
        result.error(),
        Some(FallbackError::Exhausted { tried: 2, .. })
    ));
}

#[tokio::test]
async fn test_zero_eligible_options_invoke_nothing() {
    let gated = ScriptedOperation::always_ok("gated".to_string());
    let guarded = ScriptedOperation::always_ok("guarded".to_string());
    let breaker = Arc::new(CircuitBreaker::new("guarded", CircuitBreakerConfig::default()));
    breaker.force_open();

    for strategy in [
        FallbackStrategy::Sequential,
        FallbackStrategy::Parallel,
        FallbackStrategy::Weighted,
    ] {
        let manager = manager(strategy);
        manager
            .add_option(
                OptionSpec::new("gated", gated.operation())
                    .precondition(|photo: &String| photo.ends_with(".png")),
            )
            .add_option(
                OptionSpec::new("guarded", guarded.operation())
                    .shared_circuit_breaker(Arc::clone(&breaker)),
            );

        let result = manager.execute("breakfast.jpg".to_string()).await;
        assert!(!result.is_success(), "{strategy} should fail");
        assert_eq!(result.error(), Some(&FallbackError::NoEligibleOptions));
        assert_eq!(result.attempts_made, 0);
    }

    assert_eq!(gated.calls(), 0);
    assert_eq!(guarded.calls(), 0);
}

#[tokio::test]
async fn test_every_strategy_reports_its_own_kind() {
    for strategy in [
        FallbackStrategy::Sequential,
        FallbackStrategy::Parallel,
        FallbackStrategy::Weighted,
        FallbackStrategy::Conditional,
    ] {
        let only = ScriptedOperation::always_ok("ok".to_string());
        let manager = manager(strategy);
        manager.add_option(OptionSpec::new("only", only.operation()));

        let result = manager.execute("snack.jpg".to_string()).await;
        assert!(result.is_success(), "{strategy} should succeed");
        assert_eq!(
            result.metadata.get("strategy"),
            Some(&serde_json::json!(strategy.as_str()))
        );
        assert_eq!(manager.strategy(), strategy);
        assert_eq!(manager.stats().strategy, strategy);
    }
}

#[tokio::test]
async fn test_conditional_picks_first_matching_precondition() {
    let png = ScriptedOperation::always_ok("png pipeline".to_string());
    let jpeg = ScriptedOperation::always_ok("jpeg pipeline".to_string());

    let manager = manager(FallbackStrategy::Conditional);
    manager
        .add_option(
            OptionSpec::new("png", png.operation()).precondition(|photo: &String| photo.ends_with(".png")),
        )
        .add_option(
            OptionSpec::new("jpeg", jpeg.operation()).precondition(|photo: &String| photo.ends_with(".jpg")),
        );

    let result = manager.execute("lunch.jpg".to_string()).await;
    assert_eq!(result.value().map(String::as_str), Some("jpeg pipeline"));
    assert_eq!(png.calls(), 0);

    let result = manager.execute("lunch.heic".to_string()).await;
    assert_eq!(result.error(), Some(&FallbackError::NoConditionMet));
}

#[tokio::test]
async fn test_weighted_never_picks_zero_weight_option() {
    let never = ScriptedOperation::always_ok("never".to_string());
    let always = ScriptedOperation::always_ok("always".to_string());

    let manager = manager(FallbackStrategy::Weighted);
    manager
        .add_option(OptionSpec::new("never", never.operation()).weight(0.0))
        .add_option(OptionSpec::new("always", always.operation()).weight(3.0));

    for _ in 0..20 {
        let result = manager.execute("x.jpg".to_string()).await;
        assert_eq!(result.executed_option.as_deref(), Some("always"));
        assert_eq!(result.attempts_made, 1);
    }
    assert_eq!(never.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_skips_option_until_recovery() {
    let flaky = ScriptedOperation::new()
        .then_fail(TestError::transient("500"))
        .then_ok("primary".to_string());
    let backup = ScriptedOperation::always_ok("backup".to_string());

    let manager = manager(FallbackStrategy::Sequential);
    manager
        .add_option(
            OptionSpec::new("primary", flaky.operation()).circuit_breaker(
                CircuitBreakerConfig::builder()
                    .failure_threshold(1)
                    .recovery_timeout(Duration::from_secs(60))
                    .build(),
            ),
        )
        .add_option(OptionSpec::new("backup", backup.operation()));

    let first = manager.execute("a.jpg".to_string()).await;
    assert_eq!(first.value().map(String::as_str), Some("backup"));
    assert_eq!(first.attempts_made, 2);

    // Breaker is open: primary is skipped and not counted.
    let second = manager.execute("b.jpg".to_string()).await;
    assert_eq!(second.value().map(String::as_str), Some("backup"));
    assert_eq!(second.attempts_made, 1);
    assert_eq!(flaky.calls(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let third = manager.execute("c.jpg".to_string()).await;
    assert_eq!(third.value().map(String::as_str), Some("primary"));
    assert!(!third.fallback_used);
}

#[tokio::test(start_paused = true)]
async fn test_option_retries_do_not_retry_open_circuit() {
    let failing = ScriptedOperation::<String>::always_fail(TestError::transient("503"));

    let manager = manager(FallbackStrategy::Sequential);
    manager.add_option(
        OptionSpec::new("vision", failing.operation())
            .circuit_breaker(CircuitBreakerConfig::builder().failure_threshold(2).build())
            .retry_count(5),
    );

    let result = manager.execute("a.jpg".to_string()).await;

    // Two failures open the breaker, the third attempt is rejected and ends the retries.
    assert_eq!(failing.calls(), 2);
    match result.error() {
        Some(FallbackError::Exhausted { tried: 1, last }) => {
            assert!(matches!(last, ResilienceError::CircuitOpen { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_stats_are_idempotent() {
    let manager = manager(FallbackStrategy::Sequential);
    manager
        .add_option(OptionSpec::new(
            "A",
            ScriptedOperation::<String>::always_fail(TestError::transient("a")).operation(),
        ))
        .add_option(OptionSpec::new(
            "B",
            ScriptedOperation::always_ok("B".to_string()).operation(),
        ));
    manager.execute("1.jpg".to_string()).await;
    manager.execute("2.jpg".to_string()).await;

    let first = manager.stats();
    assert_eq!(first, manager.stats());
    assert_eq!(first.total_executions, 2);
    assert_eq!(first.fallback_executions, 2);
    assert!((first.fallback_rate - 1.0).abs() < f64::EPSILON);
}
