//! Health probes and the reports they return.

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use sysinfo::{System, SystemExt};
use tokio::time::Instant;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component works but is impaired (high latency, partial outage)
    Degraded,
    /// Component is not operational
    Unhealthy,
    /// No information yet
    Unknown,
}

impl HealthStatus {
    /// All statuses, in severity order.
    pub const ALL: [Self; 4] = [Self::Healthy, Self::Degraded, Self::Unhealthy, Self::Unknown];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    /// Check if status is healthy or degraded (can accept traffic)
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Observed status
    pub status: HealthStatus,
    /// Human-readable message
    pub message: String,
    /// Additional details (latency, queue depth, ...)
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ProbeReport {
    fn with_status(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    /// Create healthy status
    #[must_use]
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, message)
    }

    /// Create degraded status
    #[must_use]
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, message)
    }

    /// Create unhealthy status
    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, message)
    }

    /// Create unknown status
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unknown, message)
    }

    /// Add detail to the report
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A liveness probe for one component.
///
/// Returning `Err` (or panicking, or exceeding the check's timeout) counts as
/// a failed attempt; the monitor retries and finally records the check as
/// unhealthy. Returning a report with any status counts as a completed check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the component once.
    async fn check(&self) -> anyhow::Result<ProbeReport>;
}

struct FnProbe<F>(F);

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ProbeReport>> + Send,
{
    async fn check(&self) -> anyhow::Result<ProbeReport> {
        (self.0)().await
    }
}

/// Build a probe from an async closure.
///
/// ```rust
/// use c0r_reliability::health::{probe_fn, ProbeReport};
///
/// let probe = probe_fn(|| async { Ok(ProbeReport::healthy("db reachable").with_detail("latency_ms", 4)) });
/// ```
pub fn probe_fn<F, Fut>(f: F) -> Arc<dyn HealthProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ProbeReport>> + Send + 'static,
{
    Arc::new(FnProbe(f))
}

/// Build a probe that attempts a connection and times it.
///
/// Success is healthy with a `response_time_ms` detail; any error is
/// unhealthy with the error text under `error`.
///
/// ```rust
/// use c0r_reliability::health::connectivity_probe;
///
/// let probe = connectivity_probe(|| async { Ok::<_, std::io::Error>(()) });
/// ```
pub fn connectivity_probe<F, Fut, T, E>(connect: F) -> Arc<dyn HealthProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: fmt::Display,
{
    probe_fn(move || {
        let attempt = connect();
        async move {
            let started = Instant::now();
            let outcome = attempt.await;
            let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;
            Ok(match outcome {
                Ok(_) => ProbeReport::healthy("connection ok").with_detail("response_time_ms", response_time_ms),
                Err(err) => ProbeReport::unhealthy(format!("connection failed: {err}"))
                    .with_detail("error", err.to_string())
                    .with_detail("response_time_ms", response_time_ms),
            })
        }
    })
}

/// Memory usage at or above this percentage is always unhealthy.
const CRITICAL_MEMORY_PERCENT: f64 = 90.0;

/// Reports host memory usage: below `threshold_percent` is healthy, below
/// 90% degraded, otherwise unhealthy.
pub struct MemoryProbe {
    threshold_percent: f64,
    system: parking_lot::Mutex<System>,
}

impl MemoryProbe {
    /// Probe host memory against `threshold_percent`.
    #[must_use]
    pub fn new(threshold_percent: f64) -> Self {
        Self {
            threshold_percent,
            system: parking_lot::Mutex::new(System::new()),
        }
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new(80.0)
    }
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    async fn check(&self) -> anyhow::Result<ProbeReport> {
        let (total_kb, available_kb) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            (system.total_memory(), system.available_memory())
        };
        Ok(classify_memory(total_kb, available_kb, self.threshold_percent))
    }
}

#[allow(clippy::cast_precision_loss)]
fn classify_memory(total_kb: u64, available_kb: u64, threshold_percent: f64) -> ProbeReport {
    if total_kb == 0 {
        return ProbeReport::unknown("memory usage unavailable");
    }
    let used_kb = total_kb.saturating_sub(available_kb);
    let usage_percent = used_kb as f64 / total_kb as f64 * 100.0;
    let rounded = (usage_percent * 10.0).round() / 10.0;

    let report = if usage_percent < threshold_percent {
        ProbeReport::healthy(format!("memory usage is normal: {rounded}%"))
    } else if usage_percent < CRITICAL_MEMORY_PERCENT {
        ProbeReport::degraded(format!("memory usage is high: {rounded}%"))
    } else {
        ProbeReport::unhealthy(format!("memory usage is critical: {rounded}%"))
    };
    let gb = |kb: u64| (kb as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
    report
        .with_detail("usage_percent", rounded)
        .with_detail("available_gb", gb(available_kb.min(total_kb)))
        .with_detail("total_gb", gb(total_kb))
        .with_detail("threshold_percent", threshold_percent)
}

/// Reports a circuit breaker's state: closed is healthy, half-open is
/// degraded, open is unhealthy.
pub struct CircuitBreakerProbe {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerProbe {
    /// Probe `breaker`.
    #[must_use]
    pub const fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl HealthProbe for CircuitBreakerProbe {
    async fn check(&self) -> anyhow::Result<ProbeReport> {
        let stats = self.breaker.stats();
        let report = match stats.state {
            CircuitState::Closed => ProbeReport::healthy("circuit closed"),
            CircuitState::HalfOpen => ProbeReport::degraded("circuit half-open, probing recovery"),
            CircuitState::Open => ProbeReport::unhealthy("circuit open"),
        };
        Ok(report
            .with_detail("breaker", stats.name)
            .with_detail("state", stats.state.as_str())
            .with_detail("consecutive_failures", stats.consecutive_failures)
            .with_detail("success_rate", stats.success_rate))
    }
}
