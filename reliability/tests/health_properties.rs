//! Integration tests for health aggregation and reporting

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use c0r_reliability::circuit_breaker::CircuitBreakerConfig;
use c0r_reliability::health::{
    CircuitBreakerProbe, HealthCheckConfig, HealthMonitor, HealthProbe, HealthStatus, ProbeReport,
    probe_fn,
};
use c0r_reliability::registry::CircuitBreakerRegistry;
use c0r_reliability_testing::probes;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn probe_for(status: HealthStatus) -> Arc<dyn HealthProbe> {
    match status {
        HealthStatus::Healthy => probes::healthy(),
        HealthStatus::Degraded => probes::degraded("slow responses"),
        HealthStatus::Unhealthy => probes::unhealthy("unreachable"),
        HealthStatus::Unknown => probe_fn(|| async { Ok(ProbeReport::unknown("no data yet")) }),
    }
}

fn any_status() -> impl Strategy<Value = HealthStatus> {
    prop_oneof![
        Just(HealthStatus::Healthy),
        Just(HealthStatus::Degraded),
        Just(HealthStatus::Unhealthy),
        Just(HealthStatus::Unknown),
    ]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn overall_unhealthy_iff_critical_check_unhealthy(
        checks in prop::collection::vec((any_status(), any::<bool>(), any::<bool>()), 1..8),
    ) {
        paused_runtime().block_on(async {
            let monitor = HealthMonitor::new("property");
            for (index, (status, critical, enabled)) in checks.iter().enumerate() {
                monitor.add_check(
                    HealthCheckConfig::new(format!("check-{index}"), probe_for(*status))
                        .critical(*critical)
                        .enabled(*enabled)
                        .retry_count(0),
                );
            }
            monitor.run_all_checks().await;

            let active: Vec<(HealthStatus, bool)> = checks
                .iter()
                .filter(|(_, _, enabled)| *enabled)
                .map(|(status, critical, _)| (*status, *critical))
                .collect();
            let critical_down = active
                .iter()
                .any(|(status, critical)| *critical && *status == HealthStatus::Unhealthy);
            let all_healthy = !active.is_empty()
                && active.iter().all(|(status, _)| *status == HealthStatus::Healthy);

            let overall = monitor.get_overall_status();
            prop_assert_eq!(overall == HealthStatus::Unhealthy, critical_down);
            prop_assert_eq!(overall == HealthStatus::Healthy, all_healthy);

            let report = monitor.get_health_report();
            prop_assert_eq!(report.overall_status, overall);
            prop_assert_eq!(report.checks.total, checks.len());
            prop_assert_eq!(report.individual_checks.len(), active.len());
            prop_assert_eq!(report.status_distribution.values().sum::<usize>(), active.len());
            Ok(())
        })?;
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_makes_critical_check_fail_report() {
    let breakers = CircuitBreakerRegistry::new();
    let vision = breakers.get_or_create("openai-vision", Some(CircuitBreakerConfig::default()));
    let database = breakers.get_or_create("database", None);

    let monitor = HealthMonitor::new("meal-analysis");
    monitor
        .add_check(
            HealthCheckConfig::new("openai-vision", Arc::new(CircuitBreakerProbe::new(Arc::clone(&vision))))
                .critical(true)
                .tag("provider"),
        )
        .add_check(
            HealthCheckConfig::new("database", Arc::new(CircuitBreakerProbe::new(database)))
                .critical(true),
        );

    monitor.run_all_checks().await;
    assert_eq!(monitor.get_overall_status(), HealthStatus::Healthy);

    vision.force_open();
    monitor.run_all_checks().await;

    let report = monitor.get_health_report();
    assert_eq!(report.overall_status, HealthStatus::Unhealthy);
    assert_eq!(report.critical_issues.len(), 1);
    assert_eq!(report.critical_issues[0].name, "openai-vision");
    assert_eq!(report.status_distribution["unhealthy"], 1);
    assert_eq!(report.status_distribution["healthy"], 1);
    assert_eq!(report.performance.total_checks, 4);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["overall_status"], "unhealthy");
    assert_eq!(json["monitor_name"], "meal-analysis");
}

#[tokio::test(start_paused = true)]
async fn test_report_does_not_run_checks() {
    let monitor = HealthMonitor::new("idle");
    monitor.add_check(HealthCheckConfig::new("db", probes::slow(Duration::from_secs(1))));

    let before = monitor.get_health_report();
    assert_eq!(before.overall_status, HealthStatus::Unknown);
    assert!(before.individual_checks.is_empty());

    monitor.run_check("db").await.unwrap();
    let first = monitor.get_health_report();
    let second = monitor.get_health_report();
    assert_eq!(first, second);
    assert_eq!(first.performance.total_checks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_probe_reports_attempts() {
    let monitor = HealthMonitor::new("flaky").with_retry_pause(Duration::from_millis(250));
    monitor.add_check(
        HealthCheckConfig::new("storage", probes::failing("connection refused")).retry_count(1),
    );

    let result = monitor.run_check("storage").await.unwrap();
    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(result.error.as_deref(), Some("connection refused"));
    assert_eq!(
        result.message,
        "Check failed after 2 attempts: connection refused"
    );
    assert_eq!(monitor.stats().failed_checks, 1);
}
