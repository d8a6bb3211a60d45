//! Provider fallback demo
//!
//! Simulates a meal photo analysis service backed by two flaky vision
//! providers and a cached estimate, and routes every request through
//! circuit breakers, retries and a sequential fallback chain. Health checks
//! watch the breakers in the background and the final report is printed as
//! JSON.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p c0r-provider-fallback-demo
//! ```
//!
//! Settings come from `C0R_RELIABILITY_ENV` and, when set,
//! `C0R_RELIABILITY_CONFIG` (a TOML file). `RUST_LOG` overrides the
//! configured log level.

#![allow(missing_docs)]

use c0r_reliability::health::{
    CircuitBreakerProbe, HealthCheckConfig, HealthMonitor, MemoryProbe, connectivity_probe,
};
use c0r_reliability::operation::{GuardedOperation, Operation, operation};
use c0r_reliability::registry::{CircuitBreakerRegistry, FallbackManagerRegistry, RetryHandlerRegistry};
use c0r_reliability::{FallbackStrategy, MetricsExporter, OptionSpec, ReliabilitySettings, RetryHandler};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

const OPENAI: &str = "openai-vision";
const GEMINI: &str = "gemini-vision";
const CACHE: &str = "cached-estimate";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
enum ProviderError {
    #[error("{0}: rate limited")]
    RateLimited(&'static str),
    #[error("{0}: service unavailable")]
    Unavailable(&'static str),
    #[error("{0}: image rejected")]
    InvalidImage(&'static str),
}

impl ProviderError {
    const fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidImage(_))
    }
}

/// Rate limited for its first `outage` calls, then answers.
fn openai_vision(outage: u32) -> Operation<String, String, ProviderError> {
    let calls = Arc::new(AtomicU32::new(0));
    operation(move |photo: String| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            if photo.ends_with(".gif") {
                return Err(ProviderError::InvalidImage(OPENAI));
            }
            if call < outage {
                return Err(ProviderError::RateLimited(OPENAI));
            }
            Ok(format!("{photo}: 640 kcal ({OPENAI})"))
        }
    })
}

/// Slower, and down on every third call.
fn gemini_vision() -> Operation<String, String, ProviderError> {
    let calls = Arc::new(AtomicU32::new(0));
    operation(move |photo: String| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            if call % 3 == 2 {
                return Err(ProviderError::Unavailable(GEMINI));
            }
            Ok(format!("{photo}: 610 kcal ({GEMINI})"))
        }
    })
}

fn cached_estimate() -> Operation<String, String, ProviderError> {
    operation(|photo: String| async move { Ok(format!("{photo}: ~500 kcal ({CACHE})")) })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Settings and tracing
    let settings = ReliabilitySettings::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.observability.log_level)),
        )
        .init();
    tracing::info!(environment = %settings.environment, "Starting provider fallback demo");

    // 2. Metrics
    let mut exporter = MetricsExporter::new();
    if settings.observability.metrics_enabled {
        exporter.install()?;
    }

    // 3. Shared components
    let breakers = CircuitBreakerRegistry::new();
    let retries: RetryHandlerRegistry<ProviderError> = RetryHandlerRegistry::new();
    let managers: FallbackManagerRegistry<String, String, ProviderError> = FallbackManagerRegistry::new();

    for provider in [OPENAI, GEMINI] {
        breakers.get_or_create(provider, Some(settings.breaker_config(provider)));
    }
    let openai_breaker = breakers.get_or_create(OPENAI, None);
    let gemini_breaker = breakers.get_or_create(GEMINI, None);
    let openai_retry = retries.create_with(OPENAI, || {
        RetryHandler::new(OPENAI, settings.retry_config(OPENAI)).retry_if(ProviderError::is_transient)
    });

    // 4. Health checks over the breakers, the cache and the host
    let cache = cached_estimate();
    let monitor = Arc::new(
        HealthMonitor::new("meal-analysis")
            .with_history_size(settings.health.history_size)
            .with_retry_pause(settings.health.retry_pause()),
    );
    monitor
        .add_check(
            HealthCheckConfig::new(OPENAI, Arc::new(CircuitBreakerProbe::new(Arc::clone(&openai_breaker))))
                .interval(Duration::from_secs(1))
                .tag("provider"),
        )
        .add_check(
            HealthCheckConfig::new(GEMINI, Arc::new(CircuitBreakerProbe::new(Arc::clone(&gemini_breaker))))
                .interval(Duration::from_secs(1))
                .tag("provider"),
        )
        .add_check(
            HealthCheckConfig::new(CACHE, connectivity_probe(move || cache(String::from("warmup.jpg"))))
                .critical(true),
        )
        .add_check(
            HealthCheckConfig::new("host-memory", Arc::new(MemoryProbe::default()))
                .interval(Duration::from_secs(5)),
        );
    monitor.start_monitoring(settings.health.tick());

    // 5. Direct guarded calls: retries absorb the first rate limits
    let direct = GuardedOperation::new(OPENAI, openai_vision(4))
        .with_circuit_breaker(Arc::clone(&openai_breaker))
        .with_retry(openai_retry);
    for photo in ["breakfast.jpg", "menu.gif"] {
        let attempt = direct.invoke(photo.to_string()).await;
        match &attempt.outcome {
            Ok(analysis) => tracing::info!(attempts = attempt.attempts_made, %analysis, "Direct call succeeded"),
            Err(err) => tracing::warn!(attempts = attempt.attempts_made, error = %err, "Direct call failed"),
        }
    }

    // 6. Fallback chain sharing the same breakers
    let chain = managers.create("meal_analysis", FallbackStrategy::Sequential);
    chain
        .add_option(
            OptionSpec::new(OPENAI, openai_vision(6))
                .shared_circuit_breaker(Arc::clone(&openai_breaker))
                .timeout(Duration::from_secs(2))
                .metadata("provider", "openai"),
        )
        .add_option(
            OptionSpec::new(GEMINI, gemini_vision())
                .shared_circuit_breaker(Arc::clone(&gemini_breaker))
                .retry_count(1)
                .metadata("provider", "google"),
        )
        .add_option(OptionSpec::new(CACHE, cached_estimate()).metadata("provider", "local"));

    for meal in 1..=12 {
        let photo = format!("meal-{meal}.jpg");
        let result = chain.execute(photo).await;
        match result.into_result() {
            Ok(analysis) => tracing::info!(%analysis, "Meal analysed"),
            Err(err) => tracing::error!(error = %err, "Meal analysis failed"),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // 7. Report
    monitor.run_all_checks().await;
    monitor.stop_monitoring().await;

    let summary = serde_json::json!({
        "health": monitor.get_health_report(),
        "breakers": breakers.all_stats(),
        "retries": retries.all_stats(),
        "fallback": managers.all_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(scrape) = exporter.render() {
        tracing::debug!(bytes = scrape.len(), "Prometheus scrape rendered");
        println!("{scrape}");
    }

    tracing::info!("Provider fallback demo finished");
    Ok(())
}
