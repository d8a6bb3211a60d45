//! Prometheus metrics for the resilience primitives.
//!
//! Every primitive emits through the `metrics` facade, labelled by its
//! component name. Nothing is recorded unless a recorder is installed, so
//! library users that don't care about metrics pay only the facade's no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use c0r_reliability::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitState;
use crate::health::HealthStatus;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the Prometheus exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the global recorder
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the Prometheus recorder and renders the scrape text.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all series and install the global Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the bucket layout is rejected and
    /// [`MetricsError::Install`] if a different recorder cannot be replaced.
    /// An already-installed recorder is tolerated with a warning.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!("Reliability metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Calls seen by a circuit breaker, by outcome"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions, by target state"
    );

    describe_counter!("retry_attempts_total", "Operation attempts made by retry handlers");
    describe_counter!(
        "retry_exhausted_total",
        "Retry executions that ended without success"
    );
    describe_histogram!(
        "retry_execution_duration_seconds",
        "Wall time of a full retry execution including delays"
    );

    describe_counter!(
        "fallback_executions_total",
        "Fallback manager executions, by outcome"
    );
    describe_histogram!(
        "fallback_option_duration_seconds",
        "Latency of a single fallback option run"
    );

    describe_counter!("health_check_runs_total", "Health check runs, by status");
    describe_histogram!(
        "health_check_duration_seconds",
        "Health check response time"
    );
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record the current state as a gauge.
    pub fn record_state(breaker: &str, state: CircuitState) {
        gauge!("circuit_breaker_state", "breaker" => breaker.to_string())
            .set(state.as_gauge());
    }

    /// Record a call outcome (`success`, `failure`, `ignored`, `rejected`).
    pub fn record_call(breaker: &str, outcome: &'static str) {
        counter!(
            "circuit_breaker_calls_total",
            "breaker" => breaker.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a state transition.
    pub fn record_transition(breaker: &str, to: CircuitState) {
        counter!(
            "circuit_breaker_transitions_total",
            "breaker" => breaker.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
        Self::record_state(breaker, to);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record one attempt.
    pub fn record_attempt(handler: &str) {
        counter!("retry_attempts_total", "handler" => handler.to_string()).increment(1);
    }

    /// Record an execution that ended in failure.
    pub fn record_exhausted(handler: &str) {
        counter!("retry_exhausted_total", "handler" => handler.to_string()).increment(1);
    }

    /// Record the wall time of a full execution.
    pub fn record_execution(handler: &str, duration: Duration) {
        histogram!("retry_execution_duration_seconds", "handler" => handler.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Fallback metrics recorder.
pub struct FallbackMetrics;

impl FallbackMetrics {
    /// Record an execution outcome (`primary`, `fallback`, `failed`).
    pub fn record_execution(manager: &str, outcome: &'static str) {
        counter!(
            "fallback_executions_total",
            "manager" => manager.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record the latency of one option run.
    pub fn record_option(manager: &str, option: &str, duration: Duration) {
        histogram!(
            "fallback_option_duration_seconds",
            "manager" => manager.to_string(),
            "option" => option.to_string()
        )
        .record(duration.as_secs_f64());
    }
}

/// Health check metrics recorder.
pub struct HealthMetrics;

impl HealthMetrics {
    /// Record a finished check run.
    pub fn record_run(check: &str, status: HealthStatus, duration: Duration) {
        counter!(
            "health_check_runs_total",
            "check" => check.to_string(),
            "status" => status.as_str()
        )
        .increment(1);
        histogram!("health_check_duration_seconds", "check" => check.to_string())
            .record(duration.as_secs_f64());
    }
}
