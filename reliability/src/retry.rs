//! Bounded retries with a configurable backoff schedule.
//!
//! A [`RetryHandler`] runs one operation up to `max_attempts` times. Errors are
//! classified after every failed attempt:
//!
//! - an error matching the handler's `stop_on` filter aborts immediately,
//! - an error not matching its `retry_if` filter (when one is set) aborts,
//! - a per-attempt timeout is always retryable,
//! - a circuit-open rejection always aborts (retrying would only be rejected again).
//!
//! Otherwise the handler sleeps for [`RetryConfig::delay_for_attempt`] and tries
//! again. [`RetryHandler::execute`] never fails: the outcome and the full
//! attempt history come back in a [`RetryResult`].
//!
//! # Example
//!
//! ```rust
//! use c0r_reliability::retry::{RetryConfig, RetryHandler, RetryStrategy};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = RetryConfig::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .strategy(RetryStrategy::Exponential)
//!     .build();
//!
//! let handler = RetryHandler::<String>::new("vision", config)
//!     .stop_on(|err| err.contains("unauthorized"));
//!
//! let result = handler.execute(|| async { Ok::<_, String>(42) }).await;
//! assert!(result.is_success());
//! # }
//! ```

use crate::error::{ErrorFilter, ResilienceError};
use crate::metrics::RetryMetrics;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff schedule between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * backoff_multiplier^(attempt - 1)`
    #[default]
    Exponential,
    /// `base_delay * attempt`
    Linear,
    /// Uniform in `[0, base_delay * attempt]`
    Jittered,
    /// `base_delay * fib(attempt)`
    Fibonacci,
}

impl RetryStrategy {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Jittered => "jittered",
            Self::Fibonacci => "fibonacci",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry configuration.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 60 seconds
/// - `strategy`: exponential, multiplier 2.0
/// - `jitter`: on, ±10%
/// - `timeout_per_attempt`: none
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay fed into the strategy formula
    pub base_delay: Duration,
    /// Upper bound applied before jitter
    pub max_delay: Duration,
    /// Backoff schedule
    pub strategy: RetryStrategy,
    /// Multiplier for the exponential schedule
    pub backoff_multiplier: f64,
    /// Whether to perturb each delay by up to `jitter_range` of itself
    pub jitter: bool,
    /// Jitter fraction (0.1 = ±10%)
    pub jitter_range: f64,
    /// Optional bound on each attempt
    pub timeout_per_attempt: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_range: 0.1,
            timeout_per_attempt: None,
        }
    }
}

impl RetryConfig {
    /// Create a new configuration builder starting from the defaults.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder {
            config: Self::default(),
        }
    }

    /// Exponential backoff preset: doubling from `base_delay` up to
    /// `max_delay`, with the default ±10% jitter.
    #[must_use]
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::builder()
            .max_attempts(max_attempts)
            .base_delay(base_delay)
            .max_delay(max_delay)
            .strategy(RetryStrategy::Exponential)
            .backoff_multiplier(2.0)
            .build()
    }

    /// Delay to sleep after failed attempt `attempt` (1-based).
    ///
    /// The strategy's raw delay is clamped to `[0, max_delay]`, then, with
    /// jitter enabled, moved by a uniform amount in `±jitter_range × delay`
    /// and floored at zero.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay.as_secs_f64();
        let raw = match self.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * self.backoff_multiplier.powi(exponent)
            }
            RetryStrategy::Linear => base * f64::from(attempt),
            RetryStrategy::Jittered => rng.gen_range(0.0..=base * f64::from(attempt)),
            RetryStrategy::Fibonacci => base * fibonacci(attempt),
        };

        let max = self.max_delay.as_secs_f64();
        let mut delay = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, max) };

        let range = clamp_jitter_range(self.jitter_range);
        if self.jitter && range > 0.0 && delay > 0.0 {
            let amount = delay * range;
            if amount.is_finite() {
                delay = (delay + rng.gen_range(-amount..=amount)).max(0.0);
            }
        }

        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }
}

/// Jitter fraction limited to `[0, 1]`; NaN disables jitter.
fn clamp_jitter_range(range: f64) -> f64 {
    if range.is_nan() { 0.0 } else { range.clamp(0.0, 1.0) }
}

/// `fib(0) = 0`, `fib(1) = 1`, in floating point so large inputs saturate.
fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (0.0_f64, 1.0_f64);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Set the total number of attempts (minimum 1).
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set the backoff schedule.
    #[must_use]
    pub const fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set the exponential multiplier.
    #[must_use]
    pub const fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    /// Set the jitter fraction, clamped to `[0, 1]` (NaN means no jitter).
    #[must_use]
    pub fn jitter_range(mut self, range: f64) -> Self {
        self.config.jitter_range = clamp_jitter_range(range);
        self
    }

    /// Bound every attempt by `timeout`.
    #[must_use]
    pub const fn timeout_per_attempt(mut self, timeout: Duration) -> Self {
        self.config.timeout_per_attempt = Some(timeout);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RetryConfig {
        self.config
    }
}

/// One entry of a retry execution's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// How long the attempt ran
    pub duration: Duration,
    /// Rendered error, `None` on success
    pub error: Option<String>,
    /// Delay slept after this attempt, if another one followed
    pub delay_before_next: Option<Duration>,
}

impl AttemptRecord {
    /// Whether this attempt succeeded.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of [`RetryHandler::execute`].
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// Final value, or the error from the last attempt
    pub outcome: Result<T, ResilienceError<E>>,
    /// Attempts actually made
    pub attempts_made: u32,
    /// Wall time including delays
    pub total_time: Duration,
    /// Per-attempt trace in order
    pub history: Vec<AttemptRecord>,
}

impl<T, E> RetryResult<T, E> {
    /// Whether the final attempt succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Borrow the value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// Borrow the final error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ResilienceError<E>> {
        self.outcome.as_ref().err()
    }

    /// Convert into a plain result, discarding the history.
    ///
    /// # Errors
    ///
    /// Returns the final attempt's error if the execution failed.
    pub fn into_result(self) -> Result<T, ResilienceError<E>> {
        self.outcome
    }
}

impl<T, E: fmt::Display> RetryResult<T, E> {
    /// Result for an operation that ran exactly once without retries.
    pub(crate) fn single(outcome: Result<T, ResilienceError<E>>, duration: Duration) -> Self {
        let error = outcome.as_ref().err().map(ToString::to_string);
        Self {
            outcome,
            attempts_made: 1,
            total_time: duration,
            history: vec![AttemptRecord {
                attempt: 1,
                duration,
                error,
                delay_before_next: None,
            }],
        }
    }
}

/// Snapshot of a handler's execution counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStats {
    /// Handler name
    pub name: String,
    /// Executions started
    pub total_executions: u64,
    /// Executions that ended in success
    pub successful_executions: u64,
    /// Executions that ended in failure
    pub failed_executions: u64,
    /// `successful_executions / total_executions` (0.0 when nothing ran)
    pub success_rate: f64,
    /// Attempts across all executions
    pub total_attempts: u64,
    /// Mean attempts per execution
    pub average_attempts: f64,
    /// Mean wall time per execution
    pub average_execution_time: Duration,
    /// Failed attempts by error kind (`operation`, `timeout`, `circuit_open`)
    pub error_counts: BTreeMap<String, u64>,
    /// Configuration echo
    pub config: RetryConfig,
}

#[derive(Debug, Default)]
struct RetryCounters {
    total_executions: u64,
    successful_executions: u64,
    failed_executions: u64,
    total_attempts: u64,
    total_time: Duration,
    error_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Retry,
    Stop(&'static str),
}

/// Runs operations with bounded retries.
pub struct RetryHandler<E> {
    name: String,
    config: RetryConfig,
    retry_if: Option<ErrorFilter<E>>,
    stop_on: Option<ErrorFilter<E>>,
    counters: Mutex<RetryCounters>,
}

impl<E> fmt::Debug for RetryHandler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandler")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("retry_if", &self.retry_if.is_some())
            .field("stop_on", &self.stop_on.is_some())
            .finish_non_exhaustive()
    }
}

impl<E> RetryHandler<E> {
    /// Create a handler that retries every operation error.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        let name = name.into();
        tracing::debug!(
            handler = %name,
            max_attempts = config.max_attempts,
            strategy = %config.strategy,
            "Retry handler initialized"
        );
        Self {
            name,
            config,
            retry_if: None,
            stop_on: None,
            counters: Mutex::new(RetryCounters::default()),
        }
    }

    /// Handler that retries only errors matching `filter`, with the default
    /// exponential schedule from `base_delay`.
    #[must_use]
    pub fn retry_on(
        name: impl Into<String>,
        max_attempts: u32,
        base_delay: Duration,
        filter: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        let config = RetryConfig::builder()
            .max_attempts(max_attempts)
            .base_delay(base_delay)
            .build();
        Self::new(name, config).retry_if(filter)
    }

    /// Only retry operation errors matching `filter`.
    #[must_use]
    pub fn retry_if(mut self, filter: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Some(Arc::new(filter));
        self
    }

    /// Abort immediately on operation errors matching `filter`.
    #[must_use]
    pub fn stop_on(mut self, filter: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.stop_on = Some(Arc::new(filter));
        self
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn classify(&self, err: &ResilienceError<E>) -> Decision {
        match err {
            ResilienceError::CircuitOpen { .. } => Decision::Stop("circuit open"),
            ResilienceError::Timeout { .. } => Decision::Retry,
            ResilienceError::Inner(inner) => {
                if self.stop_on.as_ref().is_some_and(|stop| stop(inner)) {
                    Decision::Stop("stop-on error")
                } else if self.retry_if.as_ref().is_some_and(|retry| !retry(inner)) {
                    Decision::Stop("non-retryable error")
                } else {
                    Decision::Retry
                }
            }
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.config.delay_for_attempt(attempt, &mut rng)
    }

    /// Snapshot of the execution counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> RetryStats {
        let counters = self.counters.lock();
        let executions = counters.total_executions;
        let (success_rate, average_attempts, average_execution_time) = if executions == 0 {
            (0.0, 0.0, Duration::ZERO)
        } else {
            (
                counters.successful_executions as f64 / executions as f64,
                counters.total_attempts as f64 / executions as f64,
                counters
                    .total_time
                    .checked_div(u32::try_from(executions).unwrap_or(u32::MAX))
                    .unwrap_or_default(),
            )
        };
        RetryStats {
            name: self.name.clone(),
            total_executions: executions,
            successful_executions: counters.successful_executions,
            failed_executions: counters.failed_executions,
            success_rate,
            total_attempts: counters.total_attempts,
            average_attempts,
            average_execution_time,
            error_counts: counters.error_counts.clone(),
            config: self.config.clone(),
        }
    }

    /// Zero all execution counters.
    pub fn reset_stats(&self) {
        *self.counters.lock() = RetryCounters::default();
        tracing::info!(handler = %self.name, "Retry handler stats reset");
    }

    fn finish<T>(
        &self,
        outcome: Result<T, ResilienceError<E>>,
        attempts_made: u32,
        started: Instant,
        history: Vec<AttemptRecord>,
    ) -> RetryResult<T, E> {
        let total_time = started.elapsed();
        {
            let mut counters = self.counters.lock();
            counters.total_executions += 1;
            counters.total_attempts += u64::from(attempts_made);
            counters.total_time += total_time;
            if outcome.is_ok() {
                counters.successful_executions += 1;
            } else {
                counters.failed_executions += 1;
            }
        }
        RetryMetrics::record_execution(&self.name, total_time);
        if outcome.is_err() {
            RetryMetrics::record_exhausted(&self.name);
        }
        RetryResult {
            outcome,
            attempts_made,
            total_time,
            history,
        }
    }
}

impl<E: fmt::Display> RetryHandler<E> {
    /// Run `operation` with retries. Never fails; see [`RetryResult`].
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_guarded(move || {
            let attempt = operation();
            async move { attempt.await.map_err(ResilienceError::Inner) }
        })
        .await
    }

    /// Run an operation that already reports [`ResilienceError`]s, such as a
    /// call through a circuit breaker.
    pub async fn execute_guarded<F, Fut, T>(&self, mut operation: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut history = Vec::new();
        let mut attempt = 0;

        tracing::debug!(handler = %self.name, max_attempts, "Starting retry execution");

        loop {
            attempt += 1;
            RetryMetrics::record_attempt(&self.name);
            let attempt_started = Instant::now();

            let outcome = match self.config.timeout_per_attempt {
                Some(limit) => tokio::time::timeout(limit, operation())
                    .await
                    .unwrap_or(Err(ResilienceError::Timeout { after: limit })),
                None => operation().await,
            };
            let duration = attempt_started.elapsed();

            let err = match outcome {
                Ok(value) => {
                    history.push(AttemptRecord {
                        attempt,
                        duration,
                        error: None,
                        delay_before_next: None,
                    });
                    if attempt > 1 {
                        tracing::info!(handler = %self.name, attempt, "Operation succeeded after retry");
                    }
                    return self.finish(Ok(value), attempt, started, history);
                }
                Err(err) => err,
            };

            *self
                .counters
                .lock()
                .error_counts
                .entry(err.kind().to_string())
                .or_insert(0) += 1;

            let decision = self.classify(&err);
            let delay = match decision {
                Decision::Retry if attempt < max_attempts => Some(self.next_delay(attempt)),
                _ => None,
            };
            history.push(AttemptRecord {
                attempt,
                duration,
                error: Some(err.to_string()),
                delay_before_next: delay,
            });

            match (decision, delay) {
                (_, Some(delay)) => {
                    tracing::warn!(
                        handler = %self.name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Operation failed, retrying..."
                    );
                    tokio::time::sleep(delay).await;
                }
                (Decision::Stop(reason), None) => {
                    tracing::error!(
                        handler = %self.name,
                        attempt,
                        reason,
                        error = %err,
                        "Operation failed, not retrying"
                    );
                    return self.finish(Err(err), attempt, started, history);
                }
                (Decision::Retry, None) => {
                    tracing::error!(
                        handler = %self.name,
                        attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    return self.finish(Err(err), attempt, started, history);
                }
            }
        }
    }

    /// Run `operation` with retries and return its final result directly.
    ///
    /// # Errors
    ///
    /// Returns the error from the last attempt when every attempt failed or
    /// an error stopped the retries.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(operation).await.into_result()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(strategy: RetryStrategy) -> RetryConfig {
        RetryConfig::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(60))
            .strategy(strategy)
            .jitter(false)
            .build()
    }

    fn delays(config: &RetryConfig, attempts: u32) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(7);
        (1..=attempts)
            .map(|n| config.delay_for_attempt(n, &mut rng).as_secs_f64())
            .collect()
    }

    #[test]
    fn test_exponential_delays() {
        let config = no_jitter(RetryStrategy::Exponential);
        assert_eq!(delays(&config, 4), vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn test_fixed_linear_fibonacci_delays() {
        assert_eq!(delays(&no_jitter(RetryStrategy::Fixed), 3), vec![1.0, 1.0, 1.0]);
        assert_eq!(delays(&no_jitter(RetryStrategy::Linear), 3), vec![1.0, 2.0, 3.0]);
        assert_eq!(
            delays(&no_jitter(RetryStrategy::Fibonacci), 6),
            vec![1.0, 1.0, 2.0, 3.0, 5.0, 8.0]
        );
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
            .jitter(false)
            .build();
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(config.delay_for_attempt(10, &mut rng), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(u32::MAX, &mut rng), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_strategy_within_bounds() {
        let config = no_jitter(RetryStrategy::Jittered);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..=5 {
            let delay = config.delay_for_attempt(attempt, &mut rng);
            assert!(delay <= Duration::from_secs(u64::from(attempt)));
        }
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let config = RetryConfig::builder()
            .base_delay(Duration::from_secs(2))
            .strategy(RetryStrategy::Fixed)
            .jitter_range(0.1)
            .build();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let delay = config.delay_for_attempt(1, &mut rng).as_secs_f64();
            assert!((1.8..=2.2).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_out_of_range_jitter_is_clamped() {
        let mut rng = StdRng::seed_from_u64(11);
        for range in [f64::INFINITY, f64::MAX, 7.5] {
            let config = RetryConfig::builder()
                .base_delay(Duration::from_secs(1))
                .strategy(RetryStrategy::Fixed)
                .jitter(true)
                .jitter_range(range)
                .build();
            assert!((config.jitter_range - 1.0).abs() < f64::EPSILON);
            assert!(config.delay_for_attempt(1, &mut rng) <= Duration::from_secs(2));
        }

        let config = RetryConfig::builder()
            .base_delay(Duration::from_secs(1))
            .strategy(RetryStrategy::Fixed)
            .jitter_range(f64::NAN)
            .build();
        assert!(config.jitter_range.abs() < f64::EPSILON);
        assert_eq!(config.delay_for_attempt(1, &mut rng), Duration::from_secs(1));
    }

    #[test]
    fn test_non_finite_jitter_field_does_not_panic() {
        let mut rng = StdRng::seed_from_u64(5);
        for range in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN, f64::MAX] {
            let mut config = RetryConfig::builder()
                .base_delay(Duration::from_secs(1))
                .strategy(RetryStrategy::Fixed)
                .build();
            config.jitter_range = range;
            assert!(config.delay_for_attempt(1, &mut rng) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_exponential_preset() {
        let config = RetryConfig::exponential(4, Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.strategy, RetryStrategy::Exponential);
        assert!(config.jitter);

        let unjittered = RetryConfig {
            jitter: false,
            ..config
        };
        assert_eq!(delays(&unjittered, 4), vec![0.5, 1.0, 2.0, 3.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_preset_filters_errors() {
        let handler = RetryHandler::<String>::retry_on("vision", 4, Duration::from_millis(10), |err| {
            err.starts_with("503")
        });
        assert_eq!(handler.config().max_attempts, 4);
        let calls = AtomicU32::new(0);

        let result = handler
            .execute(|| async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err::<i32, _>("503 unavailable".to_string()),
                    _ => Err("400 bad image".to_string()),
                }
            })
            .await;

        assert_eq!(result.attempts_made, 2);
        assert_eq!(
            result.error(),
            Some(&ResilienceError::Inner("400 bad image".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let handler = RetryHandler::<String>::new("test", no_jitter(RetryStrategy::Exponential));
        let calls = AtomicU32::new(0);

        let result = handler
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.value(), Some(&42));
        assert_eq!(result.attempts_made, 3);
        assert_eq!(result.history.len(), 3);
        assert_eq!(
            result.history[0].delay_before_next,
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            result.history[1].delay_before_next,
            Some(Duration::from_secs(2))
        );
        assert!(result.history[2].succeeded());
        assert!(result.total_time >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let handler = RetryHandler::<String>::new("test", no_jitter(RetryStrategy::Fixed));
        let calls = AtomicU32::new(0);

        let result = handler
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("always".to_string())
            })
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts_made, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.history[2].delay_before_next, None);
        assert_eq!(
            result.error(),
            Some(&ResilienceError::Inner("always".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_aborts_immediately() {
        let handler = RetryHandler::<String>::new(
            "test",
            RetryConfig::builder().max_attempts(5).jitter(false).build(),
        )
        .stop_on(|err| err == "unauthorized");
        let calls = AtomicU32::new(0);

        let result = handler
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("unauthorized".to_string())
            })
            .await;

        assert_eq!(result.attempts_made, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_skips_non_retryable() {
        let handler = RetryHandler::<String>::new("test", no_jitter(RetryStrategy::Fixed))
            .retry_if(|err| err.starts_with("transient"));

        let result = handler
            .execute(|| async { Err::<i32, _>("malformed request".to_string()) })
            .await;

        assert_eq!(result.attempts_made, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let handler = RetryHandler::<String>::new(
            "test",
            RetryConfig::builder()
                .base_delay(Duration::from_millis(10))
                .jitter(false)
                .timeout_per_attempt(Duration::from_millis(100))
                .build(),
        )
        .retry_if(|_| false);
        let calls = AtomicU32::new(0);

        let result = handler
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, String>(7)
            })
            .await;

        assert_eq!(result.value(), Some(&7));
        assert_eq!(result.attempts_made, 2);
        assert_eq!(handler.stats().error_counts.get("timeout"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_is_not_retried() {
        let handler = RetryHandler::<String>::new("test", no_jitter(RetryStrategy::Fixed));

        let result = handler
            .execute_guarded(|| async {
                Err::<i32, _>(ResilienceError::CircuitOpen {
                    breaker: "vision".to_string(),
                })
            })
            .await;

        assert_eq!(result.attempts_made, 1);
        assert!(result.error().is_some_and(ResilienceError::is_circuit_open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_reset() {
        let handler = RetryHandler::<String>::new("test", no_jitter(RetryStrategy::Fixed));
        let _ = handler.execute(|| async { Ok::<_, String>(1) }).await;
        let _ = handler
            .execute(|| async { Err::<i32, _>("down".to_string()) })
            .await;

        let stats = handler.stats();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.total_attempts, 4);
        assert!((stats.average_attempts - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.error_counts.get("operation"), Some(&3));
        assert_eq!(handler.stats(), stats);

        handler.reset_stats();
        assert_eq!(handler.stats().total_executions, 0);
    }

    #[tokio::test]
    async fn test_call_returns_plain_result() {
        let handler = RetryHandler::<String>::new("test", RetryConfig::default());
        let value = handler.call(|| async { Ok::<_, String>("ok") }).await;
        assert_eq!(value, Ok("ok"));
    }
}
