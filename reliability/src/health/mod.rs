//! Health monitoring for the components behind the resilience layer.
//!
//! A [`HealthMonitor`] owns a set of named checks. Each check wraps a
//! [`HealthProbe`] with an interval, a timeout and a retry budget. Checks run
//! on demand ([`HealthMonitor::run_check`], [`HealthMonitor::run_all_checks`])
//! or from a background loop ([`HealthMonitor::start_monitoring`]) that runs
//! every check whose interval has elapsed.
//!
//! Probes execute on their own spawned task: a probe that panics is recorded
//! as a failed attempt, and a probe that overruns its timeout is aborted.
//!
//! # Example
//!
//! ```rust
//! use c0r_reliability::health::{probe_fn, HealthCheckConfig, HealthMonitor, HealthStatus, ProbeReport};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let monitor = HealthMonitor::new("vision");
//! monitor.add_check(
//!     HealthCheckConfig::new("database", probe_fn(|| async { Ok(ProbeReport::healthy("reachable")) }))
//!         .critical(true)
//!         .timeout(Duration::from_secs(2)),
//! );
//!
//! monitor.run_all_checks().await;
//! assert_eq!(monitor.get_overall_status(), HealthStatus::Healthy);
//! # }
//! ```

mod probe;

pub use probe::{
    CircuitBreakerProbe, HealthProbe, HealthStatus, MemoryProbe, ProbeReport, connectivity_probe, probe_fn,
};

use crate::metrics::HealthMetrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Default number of results kept per check.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Default pause between attempts of a failing probe.
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// How long [`HealthMonitor::stop_monitoring`] waits before aborting the loop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Configuration of a single health check.
#[derive(Clone)]
pub struct HealthCheckConfig {
    /// Check name, unique within a monitor
    pub name: String,
    /// The probe to run
    pub probe: Arc<dyn HealthProbe>,
    /// Time between runs in the monitoring loop
    pub interval: Duration,
    /// Bound on a single probe attempt
    pub timeout: Duration,
    /// Disabled checks are skipped and excluded from aggregation
    pub enabled: bool,
    /// A critical check that is unhealthy makes the whole monitor unhealthy
    pub critical: bool,
    /// Extra attempts after a failed probe
    pub retry_count: u32,
    /// Free-form labels
    pub tags: Vec<String>,
}

impl HealthCheckConfig {
    /// New check with a 60 s interval, 10 s timeout and 2 retries.
    #[must_use]
    pub fn new(name: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            name: name.into(),
            probe,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            enabled: true,
            critical: false,
            retry_count: 2,
            tags: Vec::new(),
        }
    }

    /// Set run interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set per-attempt timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable the check.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Mark the check as critical.
    #[must_use]
    pub const fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Set number of retries after a failed attempt.
    #[must_use]
    pub const fn retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

impl fmt::Debug for HealthCheckConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckConfig")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .field("critical", &self.critical)
            .field("retry_count", &self.retry_count)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Outcome of one check run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,
    /// Observed status
    pub status: HealthStatus,
    /// Human-readable message
    pub message: String,
    /// Details reported by the probe
    pub details: BTreeMap<String, serde_json::Value>,
    /// When the run finished
    pub timestamp: DateTime<Utc>,
    /// Duration of the last attempt
    pub response_time: Duration,
    /// Last probe error, set when every attempt failed
    pub error: Option<String>,
}

impl HealthCheckResult {
    fn from_report(name: &str, report: ProbeReport, response_time: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: report.status,
            message: report.message,
            details: report.details,
            timestamp: Utc::now(),
            response_time,
            error: None,
        }
    }

    fn failed(name: &str, attempts: u32, error: String, response_time: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            message: format!("Check failed after {attempts} attempts: {error}"),
            details: BTreeMap::new(),
            timestamp: Utc::now(),
            response_time,
            error: Some(error),
        }
    }
}

/// Check counts in a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckCounts {
    /// Registered checks
    pub total: usize,
    /// Enabled checks
    pub enabled: usize,
    /// Critical checks
    pub critical: usize,
}

/// A critical check that is not healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalIssue {
    /// Check name
    pub name: String,
    /// Latest status
    pub status: HealthStatus,
    /// Latest message
    pub message: String,
    /// When the latest result was recorded
    pub timestamp: DateTime<Utc>,
}

/// Run statistics since creation or the last [`HealthMonitor::reset_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStats {
    /// Check runs executed
    pub total_checks: u64,
    /// Runs where the probe returned a report
    pub successful_checks: u64,
    /// Runs where every attempt failed
    pub failed_checks: u64,
    /// `successful_checks / total_checks` (0.0 when nothing ran)
    pub success_rate: f64,
    /// Mean response time over all runs
    pub average_response_time: Duration,
    /// Start of the statistics window
    pub since: DateTime<Utc>,
}

/// Full health summary of a monitor.
///
/// Contains no wall-clock "now" field, so two reports taken without an
/// intervening run compare equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Monitor name
    pub monitor_name: String,
    /// Aggregated status
    pub overall_status: HealthStatus,
    /// Check counts
    pub checks: CheckCounts,
    /// Latest result count per status, every status present
    pub status_distribution: BTreeMap<String, usize>,
    /// Critical checks whose latest result is not healthy
    pub critical_issues: Vec<CriticalIssue>,
    /// Run statistics
    pub performance: MonitorStats,
    /// Latest result per check
    pub individual_checks: BTreeMap<String, HealthCheckResult>,
}

struct CheckEntry {
    config: HealthCheckConfig,
    latest: Option<HealthCheckResult>,
    history: VecDeque<HealthCheckResult>,
    last_run: Option<Instant>,
}

impl CheckEntry {
    const fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            latest: None,
            history: VecDeque::new(),
            last_run: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.config.enabled
            && self
                .last_run
                .is_none_or(|last| now.duration_since(last) >= self.config.interval)
    }
}

struct MonitorCounters {
    total_checks: u64,
    successful_checks: u64,
    failed_checks: u64,
    total_response_time: Duration,
    since: DateTime<Utc>,
}

impl MonitorCounters {
    fn new() -> Self {
        Self {
            total_checks: 0,
            successful_checks: 0,
            failed_checks: 0,
            total_response_time: Duration::ZERO,
            since: Utc::now(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> MonitorStats {
        let success_rate = if self.total_checks == 0 {
            0.0
        } else {
            self.successful_checks as f64 / self.total_checks as f64
        };
        let average_response_time = u32::try_from(self.total_checks)
            .ok()
            .and_then(|runs| self.total_response_time.checked_div(runs))
            .unwrap_or_default();
        MonitorStats {
            total_checks: self.total_checks,
            successful_checks: self.successful_checks,
            failed_checks: self.failed_checks,
            success_rate,
            average_response_time,
            since: self.since,
        }
    }
}

struct MonitorState {
    checks: BTreeMap<String, CheckEntry>,
    counters: MonitorCounters,
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Aggregate the latest statuses of enabled checks.
///
/// Critical and unhealthy wins; any other unhealthy or degraded check
/// degrades the whole; all healthy is healthy; anything else is unknown.
fn aggregate(results: impl IntoIterator<Item = (bool, HealthStatus)>) -> HealthStatus {
    let mut seen = 0usize;
    let mut healthy = 0usize;
    let mut degraded = false;
    for (critical, status) in results {
        seen += 1;
        match status {
            HealthStatus::Unhealthy if critical => return HealthStatus::Unhealthy,
            HealthStatus::Unhealthy | HealthStatus::Degraded => degraded = true,
            HealthStatus::Healthy => healthy += 1,
            HealthStatus::Unknown => {}
        }
    }

    if degraded {
        HealthStatus::Degraded
    } else if seen > 0 && healthy == seen {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unknown
    }
}

/// Run `probe` once on its own task, bounded by `timeout`.
async fn run_probe(probe: &Arc<dyn HealthProbe>, timeout: Duration) -> Result<ProbeReport, String> {
    let probe = Arc::clone(probe);
    let mut task = tokio::spawn(async move { probe.check().await });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(report))) => Ok(report),
        Ok(Ok(Err(err))) => Err(format!("{err:#}")),
        Ok(Err(join_err)) if join_err.is_panic() => Err("probe panicked".to_string()),
        Ok(Err(_)) => Err("probe was cancelled".to_string()),
        Err(_) => {
            task.abort();
            Err(format!("timed out after {timeout:?}"))
        }
    }
}

/// Runs health checks and aggregates their results.
pub struct HealthMonitor {
    name: String,
    history_size: usize,
    retry_pause: Duration,
    state: RwLock<MonitorState>,
    task: Mutex<Option<MonitorTask>>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("name", &self.name)
            .field("history_size", &self.history_size)
            .field("retry_pause", &self.retry_pause)
            .field("checks", &self.check_names())
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

impl HealthMonitor {
    /// Create an empty monitor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history_size: DEFAULT_HISTORY_SIZE,
            retry_pause: DEFAULT_RETRY_PAUSE,
            state: RwLock::new(MonitorState {
                checks: BTreeMap::new(),
                counters: MonitorCounters::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Keep at most `size` results per check (at least one).
    #[must_use]
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size.max(1);
        self
    }

    /// Pause between attempts of a failing probe.
    #[must_use]
    pub const fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Monitor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a check, replacing (and clearing the results of) any check
    /// with the same name.
    pub fn add_check(&self, config: HealthCheckConfig) -> &Self {
        let name = config.name.clone();
        let replaced = self
            .state
            .write()
            .checks
            .insert(name.clone(), CheckEntry::new(config))
            .is_some();
        tracing::info!(monitor = %self.name, check = %name, replaced, "Health check registered");
        self
    }

    /// Remove a check and its results. Returns whether it existed.
    pub fn remove_check(&self, name: &str) -> bool {
        let removed = self.state.write().checks.remove(name).is_some();
        if removed {
            tracing::info!(monitor = %self.name, check = %name, "Health check removed");
        }
        removed
    }

    /// Names of registered checks, sorted.
    #[must_use]
    pub fn check_names(&self) -> Vec<String> {
        self.state.read().checks.keys().cloned().collect()
    }

    /// Enable a check. Returns whether it exists.
    pub fn enable_check(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Disable a check. Returns whether it exists.
    pub fn disable_check(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let found = self
            .state
            .write()
            .checks
            .get_mut(name)
            .map(|entry| entry.config.enabled = enabled)
            .is_some();
        if found {
            tracing::info!(monitor = %self.name, check = %name, enabled, "Health check toggled");
        }
        found
    }

    /// Run one check now.
    ///
    /// Returns `None` when the check is unknown or disabled.
    pub async fn run_check(&self, name: &str) -> Option<HealthCheckResult> {
        let config = {
            let state = self.state.read();
            match state.checks.get(name) {
                Some(entry) if entry.config.enabled => entry.config.clone(),
                Some(_) => {
                    tracing::debug!(monitor = %self.name, check = %name, "Health check disabled, not running");
                    return None;
                }
                None => {
                    tracing::warn!(monitor = %self.name, check = %name, "Unknown health check");
                    return None;
                }
            }
        };
        Some(self.execute_check(config).await)
    }

    /// Run every enabled check concurrently.
    pub async fn run_all_checks(&self) -> BTreeMap<String, HealthCheckResult> {
        let configs: Vec<HealthCheckConfig> = self
            .state
            .read()
            .checks
            .values()
            .filter(|entry| entry.config.enabled)
            .map(|entry| entry.config.clone())
            .collect();
        self.execute_all(configs).await
    }

    async fn run_due_checks(&self) {
        let now = Instant::now();
        let due: Vec<HealthCheckConfig> = self
            .state
            .read()
            .checks
            .values()
            .filter(|entry| entry.is_due(now))
            .map(|entry| entry.config.clone())
            .collect();
        if !due.is_empty() {
            tracing::debug!(monitor = %self.name, due = due.len(), "Running due health checks");
            self.execute_all(due).await;
        }
    }

    async fn execute_all(&self, configs: Vec<HealthCheckConfig>) -> BTreeMap<String, HealthCheckResult> {
        join_all(configs.into_iter().map(|config| self.execute_check(config)))
            .await
            .into_iter()
            .map(|result| (result.name.clone(), result))
            .collect()
    }

    async fn execute_check(&self, config: HealthCheckConfig) -> HealthCheckResult {
        let attempts = config.retry_count.saturating_add(1);
        let mut last_error = String::new();
        let mut last_elapsed = Duration::ZERO;

        for attempt in 1..=attempts {
            let started = Instant::now();
            match run_probe(&config.probe, config.timeout).await {
                Ok(report) => {
                    let result = HealthCheckResult::from_report(&config.name, report, started.elapsed());
                    self.record(&config.name, &result, true);
                    return result;
                }
                Err(err) => {
                    last_elapsed = started.elapsed();
                    tracing::warn!(
                        monitor = %self.name,
                        check = %config.name,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Health probe attempt failed"
                    );
                    last_error = err;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }

        let result = HealthCheckResult::failed(&config.name, attempts, last_error, last_elapsed);
        self.record(&config.name, &result, false);
        result
    }

    fn record(&self, name: &str, result: &HealthCheckResult, success: bool) {
        HealthMetrics::record_run(name, result.status, result.response_time);

        let previous = {
            let mut state = self.state.write();
            let counters = &mut state.counters;
            counters.total_checks += 1;
            counters.total_response_time += result.response_time;
            if success {
                counters.successful_checks += 1;
            } else {
                counters.failed_checks += 1;
            }

            // The check may have been removed while its probe was running.
            let Some(entry) = state.checks.get_mut(name) else {
                return;
            };
            entry.history.push_back(result.clone());
            while entry.history.len() > self.history_size {
                entry.history.pop_front();
            }
            entry.last_run = Some(Instant::now());
            entry.latest.replace(result.clone()).map(|previous| previous.status)
        };

        if previous.is_some_and(|status| status != result.status) {
            tracing::info!(
                monitor = %self.name,
                check = %name,
                from = %previous.unwrap_or(HealthStatus::Unknown),
                to = %result.status,
                "Health check status changed"
            );
        } else {
            tracing::debug!(monitor = %self.name, check = %name, status = %result.status, "Health check recorded");
        }
    }

    /// Latest result of a check.
    #[must_use]
    pub fn latest_result(&self, name: &str) -> Option<HealthCheckResult> {
        self.state.read().checks.get(name).and_then(|entry| entry.latest.clone())
    }

    /// The last `limit` results of a check, oldest first. `limit == 0`
    /// returns the whole retained history.
    #[must_use]
    pub fn get_check_history(&self, name: &str, limit: usize) -> Vec<HealthCheckResult> {
        let state = self.state.read();
        let Some(entry) = state.checks.get(name) else {
            return Vec::new();
        };
        let skip = if limit == 0 {
            0
        } else {
            entry.history.len().saturating_sub(limit)
        };
        entry.history.iter().skip(skip).cloned().collect()
    }

    /// Aggregated status over enabled checks that have a result.
    #[must_use]
    pub fn get_overall_status(&self) -> HealthStatus {
        Self::overall(&self.state.read())
    }

    fn overall(state: &MonitorState) -> HealthStatus {
        aggregate(
            state
                .checks
                .values()
                .filter(|entry| entry.config.enabled)
                .filter_map(|entry| entry.latest.as_ref().map(|latest| (entry.config.critical, latest.status))),
        )
    }

    /// Full report. Does not run any check.
    #[must_use]
    pub fn get_health_report(&self) -> HealthReport {
        let state = self.state.read();

        let mut status_distribution: BTreeMap<String, usize> = HealthStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let mut critical_issues = Vec::new();
        let mut individual_checks = BTreeMap::new();
        let mut counts = CheckCounts {
            total: state.checks.len(),
            enabled: 0,
            critical: 0,
        };

        for (name, entry) in &state.checks {
            if entry.config.enabled {
                counts.enabled += 1;
            }
            if entry.config.critical {
                counts.critical += 1;
            }
            let Some(latest) = &entry.latest else {
                continue;
            };
            *status_distribution
                .entry(latest.status.as_str().to_string())
                .or_default() += 1;
            if entry.config.critical && latest.status != HealthStatus::Healthy {
                critical_issues.push(CriticalIssue {
                    name: name.clone(),
                    status: latest.status,
                    message: latest.message.clone(),
                    timestamp: latest.timestamp,
                });
            }
            individual_checks.insert(name.clone(), latest.clone());
        }

        HealthReport {
            monitor_name: self.name.clone(),
            overall_status: Self::overall(&state),
            checks: counts,
            status_distribution,
            critical_issues,
            performance: state.counters.snapshot(),
            individual_checks,
        }
    }

    /// Run statistics.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        self.state.read().counters.snapshot()
    }

    /// Reset run statistics. Latest results and history are kept.
    pub fn reset_stats(&self) {
        self.state.write().counters = MonitorCounters::new();
        tracing::info!(monitor = %self.name, "Health monitor stats reset");
    }

    /// Start the background loop, waking every `tick` to run the checks
    /// whose interval has elapsed.
    ///
    /// The loop holds only a weak reference and ends on its own once the
    /// monitor is dropped. Must be called within a Tokio runtime. Returns
    /// `false` when a loop is already running.
    pub fn start_monitoring(self: &Arc<Self>, tick: Duration) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            tracing::warn!(monitor = %self.name, "Health monitoring already running");
            return false;
        }

        let tick = tick.max(Duration::from_millis(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::downgrade(self);
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else {
                            break;
                        };
                        monitor.run_due_checks().await;
                    }
                }
            }
            tracing::info!(monitor = %name, "Health monitoring loop exited");
        });

        *task = Some(MonitorTask { shutdown, handle });
        tracing::info!(monitor = %self.name, tick_ms = tick.as_millis(), "Health monitoring started");
        true
    }

    /// Signal the background loop to stop and wait for it, aborting it if it
    /// does not finish within five seconds. Returns `false` when no loop was
    /// running.
    pub async fn stop_monitoring(&self) -> bool {
        let task = self.task.lock().take();
        let Some(MonitorTask { shutdown, mut handle }) = task else {
            tracing::warn!(monitor = %self.name, "Health monitoring not running");
            return false;
        };

        let _ = shutdown.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            tracing::warn!(monitor = %self.name, "Health monitoring loop did not stop in time, aborting");
            handle.abort();
        }
        tracing::info!(monitor = %self.name, "Health monitoring stopped");
        true
    }

    /// Whether the background loop is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn healthy() -> Arc<dyn HealthProbe> {
        probe_fn(|| async { Ok(ProbeReport::healthy("ok")) })
    }

    fn unhealthy() -> Arc<dyn HealthProbe> {
        probe_fn(|| async { Ok(ProbeReport::unhealthy("down")) })
    }

    fn counting(calls: Arc<AtomicU32>) -> Arc<dyn HealthProbe> {
        probe_fn(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ProbeReport::healthy("ok"))
            }
        })
    }

    #[test]
    fn test_aggregate() {
        use HealthStatus::{Degraded, Healthy, Unhealthy, Unknown};

        assert_eq!(aggregate([]), Unknown);
        assert_eq!(aggregate([(false, Healthy), (true, Healthy)]), Healthy);
        assert_eq!(aggregate([(true, Unhealthy), (false, Healthy)]), Unhealthy);
        assert_eq!(aggregate([(false, Unhealthy), (true, Healthy)]), Degraded);
        assert_eq!(aggregate([(false, Degraded), (false, Healthy)]), Degraded);
        assert_eq!(aggregate([(false, Healthy), (false, Unknown)]), Unknown);
        assert_eq!(aggregate([(false, Degraded), (true, Unhealthy)]), Unhealthy);
    }

    #[tokio::test]
    async fn test_run_check_records_result() {
        let monitor = HealthMonitor::new("svc");
        monitor.add_check(HealthCheckConfig::new("db", healthy()));

        let result = monitor.run_check("db").await.unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(monitor.latest_result("db"), Some(result));
        assert_eq!(monitor.stats().successful_checks, 1);
        assert!(monitor.run_check("missing").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_probe_is_retried_then_unhealthy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let probe = probe_fn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("connection refused"))
            }
        });
        let monitor = HealthMonitor::new("svc");
        monitor.add_check(HealthCheckConfig::new("db", probe).retry_count(2));

        let started = Instant::now();
        let result = monitor.run_check("db").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("connection refused"));
        assert_eq!(result.message, "Check failed after 3 attempts: connection refused");
        assert_eq!(monitor.stats().failed_checks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_probe_is_aborted() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let probe = probe_fn(move || {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(ProbeReport::healthy("late"))
            }
        });
        let monitor = HealthMonitor::new("svc");
        monitor.add_check(
            HealthCheckConfig::new("slow", probe)
                .timeout(Duration::from_millis(100))
                .retry_count(0),
        );

        let result = monitor.run_check("slow").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.unwrap().contains("timed out"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_probe_is_recorded_as_failure() {
        let probe = probe_fn(|| async {
            if true {
                panic!("probe exploded");
            }
            Ok(ProbeReport::healthy("unreachable"))
        });
        let monitor = HealthMonitor::new("svc");
        monitor.add_check(HealthCheckConfig::new("boom", probe).retry_count(0));

        let result = monitor.run_check("boom").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("probe panicked"));
    }

    #[tokio::test]
    async fn test_overall_status_respects_critical_and_enabled() {
        let monitor = HealthMonitor::new("svc");
        monitor
            .add_check(HealthCheckConfig::new("db", unhealthy()).critical(true))
            .add_check(HealthCheckConfig::new("cache", healthy()));

        assert_eq!(monitor.get_overall_status(), HealthStatus::Unknown);

        monitor.run_all_checks().await;
        assert_eq!(monitor.get_overall_status(), HealthStatus::Unhealthy);

        assert!(monitor.disable_check("db"));
        assert_eq!(monitor.get_overall_status(), HealthStatus::Healthy);
        assert!(monitor.run_check("db").await.is_none());
        assert!(!monitor.disable_check("missing"));
    }

    #[tokio::test]
    async fn test_non_critical_unhealthy_degrades() {
        let monitor = HealthMonitor::new("svc");
        monitor
            .add_check(HealthCheckConfig::new("cache", unhealthy()))
            .add_check(HealthCheckConfig::new("db", healthy()).critical(true));

        monitor.run_all_checks().await;
        assert_eq!(monitor.get_overall_status(), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let monitor = HealthMonitor::new("svc").with_history_size(3);
        monitor.add_check(HealthCheckConfig::new("db", healthy()));

        for _ in 0..5 {
            monitor.run_check("db").await;
        }

        assert_eq!(monitor.get_check_history("db", 0).len(), 3);
        let last_two = monitor.get_check_history("db", 2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1], monitor.latest_result("db").unwrap());
        assert!(monitor.get_check_history("missing", 10).is_empty());
    }

    #[tokio::test]
    async fn test_report_is_idempotent() {
        let monitor = HealthMonitor::new("svc");
        monitor
            .add_check(HealthCheckConfig::new("db", unhealthy()).critical(true))
            .add_check(HealthCheckConfig::new("cache", healthy()).enabled(false));
        monitor.run_all_checks().await;

        let first = monitor.get_health_report();
        let second = monitor.get_health_report();
        assert_eq!(first, second);

        assert_eq!(first.overall_status, HealthStatus::Unhealthy);
        assert_eq!(
            first.checks,
            CheckCounts {
                total: 2,
                enabled: 1,
                critical: 1
            }
        );
        assert_eq!(first.status_distribution.len(), 4);
        assert_eq!(first.status_distribution["unhealthy"], 1);
        assert_eq!(first.critical_issues.len(), 1);
        assert_eq!(first.critical_issues[0].name, "db");
        assert!(first.individual_checks.contains_key("db"));
        assert!(!first.individual_checks.contains_key("cache"));

        let json = serde_json::to_value(&first).unwrap();
        assert_eq!(json["overall_status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_reset_stats_keeps_results() {
        let monitor = HealthMonitor::new("svc");
        monitor.add_check(HealthCheckConfig::new("db", healthy()));
        monitor.run_all_checks().await;

        monitor.reset_stats();
        assert_eq!(monitor.stats().total_checks, 0);
        assert!(monitor.latest_result("db").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_loop_runs_due_checks() {
        let calls = Arc::new(AtomicU32::new(0));
        let monitor = Arc::new(HealthMonitor::new("svc"));
        monitor.add_check(
            HealthCheckConfig::new("db", counting(Arc::clone(&calls))).interval(Duration::from_secs(10)),
        );

        assert!(monitor.start_monitoring(Duration::from_secs(1)));
        assert!(!monitor.start_monitoring(Duration::from_secs(1)));
        assert!(monitor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(25_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert!(monitor.stop_monitoring().await);
        assert!(!monitor.is_monitoring());
        assert!(!monitor.stop_monitoring().await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
