//! Circuit breaker pattern for protecting calls to an unreliable provider.
//!
//! A circuit breaker counts consecutive failures of one logical operation and
//! "opens" (rejects calls without running them) once a threshold is crossed.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Consecutive failures are counted.
//! - **Open**: Calls are rejected with [`ResilienceError::CircuitOpen`] until
//!   `recovery_timeout` has passed since the breaker opened.
//! - **HalfOpen**: The first call after the recovery window runs as a probe.
//!   Any failure reopens the breaker; `success_threshold` consecutive successes
//!   close it.
//!
//! The Open -> `HalfOpen` move is call-triggered: a breaker that sees no
//! traffic stays Open (as reported by [`CircuitBreaker::state`]) until the next
//! call arrives, even after its window has elapsed.
//!
//! # Example
//!
//! ```rust
//! use c0r_reliability::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .recovery_timeout(Duration::from_secs(60))
//!     .success_threshold(3)
//!     .build();
//!
//! let breaker = CircuitBreaker::new("openai-vision", config);
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use crate::error::ResilienceError;
use crate::metrics::CircuitBreakerMetrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe call is allowed
    pub recovery_timeout: Duration,
    /// Consecutive successes in `HalfOpen` before closing the circuit
    pub success_threshold: u32,
    /// Upper bound on a single call; exceeding it counts as a failure
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder starting from the defaults.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold (minimum 1).
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold.max(1);
        self
    }

    /// Set how long to wait in Open before allowing a probe call.
    #[must_use]
    pub const fn recovery_timeout(mut self, duration: Duration) -> Self {
        self.config.recovery_timeout = duration;
        self
    }

    /// Set the success threshold (minimum 1).
    #[must_use]
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold.max(1);
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        self.config
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls are rejected without running
    Open,
    /// Probe calls run to test recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Every call seen, including rejected ones
    pub total_requests: u64,
    /// Calls that ran and succeeded
    pub successful_requests: u64,
    /// Calls that ran and failed (including timeouts)
    pub failed_requests: u64,
    /// Calls rejected because the circuit was open
    pub rejected_requests: u64,
    /// Current run of failures
    pub consecutive_failures: u32,
    /// Current run of successes
    pub consecutive_successes: u32,
    /// Wall-clock time of the last failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Wall-clock time of the last success
    pub last_success_time: Option<DateTime<Utc>>,
    /// Number of real state transitions
    pub state_changes: u64,
    /// `successful_requests / total_requests` (0.0 when nothing ran)
    pub success_rate: f64,
    /// Configuration echo
    pub config: CircuitBreakerConfig,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    state_changes: u64,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_time: None,
            last_success_time: None,
            state_changes: 0,
        }
    }

    fn recovery_elapsed(&self, recovery_timeout: Duration) -> bool {
        self.opened_at
            .is_none_or(|opened| opened.elapsed() >= recovery_timeout)
    }

    fn permits(&self, recovery_timeout: Duration) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.recovery_elapsed(recovery_timeout),
        }
    }

    /// Move to `to`. Returns false if already there.
    fn transition(&mut self, name: &str, to: CircuitState) -> bool {
        let from = self.state;
        if from == to {
            return false;
        }
        self.state = to;
        self.state_changes += 1;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.consecutive_successes = 0;
                tracing::warn!(breaker = %name, %from, "Circuit breaker transitioning to OPEN");
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes = 0;
                tracing::info!(breaker = %name, %from, "Circuit breaker transitioning to HALF_OPEN");
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                tracing::info!(breaker = %name, %from, "Circuit breaker transitioning to CLOSED");
            }
        }
        CircuitBreakerMetrics::record_transition(name, to);
        true
    }
}

/// Circuit breaker for one logical operation.
///
/// Calls through one breaker are serialised by an async call lock; counters
/// live behind a separate short lock so [`stats`](Self::stats) never waits on
/// an in-flight call. Different breakers share nothing.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    call_lock: tokio::sync::Mutex<()>,
}

impl CircuitBreaker {
    /// Create a new closed circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout = ?config.recovery_timeout,
            success_threshold = config.success_threshold,
            "Circuit breaker initialized"
        );
        CircuitBreakerMetrics::record_state(&name, CircuitState::Closed);
        Self {
            name,
            config,
            state: Mutex::new(BreakerState::new()),
            call_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current recorded state.
    ///
    /// An Open breaker whose window has elapsed still reports Open until the
    /// next call moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Whether the state is Closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Whether the state is Open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Whether the state is `HalfOpen`.
    #[must_use]
    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Whether a call made now would be admitted. Does not change state.
    #[must_use]
    pub fn is_call_permitted(&self) -> bool {
        self.state.lock().permits(self.config.recovery_timeout)
    }

    /// Call an operation through the breaker. Every error counts as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without running the operation
    /// if the circuit is open, [`ResilienceError::Timeout`] if the call exceeds
    /// the configured timeout, or [`ResilienceError::Inner`] with the
    /// operation's own error.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |_| true).await
    }

    /// Call an operation, counting only errors matching `is_failure`.
    ///
    /// Errors that don't match are returned to the caller but leave the
    /// breaker's failure and success runs untouched.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        self.guard(
            move || async move { operation().await.map_err(ResilienceError::Inner) },
            is_failure,
        )
        .await
    }

    /// Guard an operation that already reports [`ResilienceError`]s.
    ///
    /// Timeouts and nested circuit-open rejections always count as failures;
    /// inner errors count only when `is_failure` matches.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call), plus any error the operation returns.
    pub async fn guard<F, Fut, T, E, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        C: Fn(&E) -> bool,
    {
        // Fast rejection without queueing behind an in-flight call.
        if !self.is_call_permitted() {
            return Err(self.reject());
        }

        let _permit = self.call_lock.lock().await;
        self.admit()?;

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::Timeout {
                after: self.config.timeout,
            }),
        };

        match &outcome {
            Ok(_) => self.on_success(started.elapsed()),
            Err(ResilienceError::Inner(err)) if !is_failure(err) => self.on_ignored(),
            Err(err) => self.on_failure(err.kind()),
        }
        outcome
    }

    /// Count a call and decide whether it may run, moving Open -> `HalfOpen`
    /// once the recovery window has elapsed.
    fn admit<E>(&self) -> Result<(), ResilienceError<E>> {
        let mut state = self.state.lock();
        if state.state == CircuitState::Open {
            if !state.recovery_elapsed(self.config.recovery_timeout) {
                drop(state);
                return Err(self.reject());
            }
            state.transition(&self.name, CircuitState::HalfOpen);
        }
        state.total_requests += 1;
        Ok(())
    }

    fn reject<E>(&self) -> ResilienceError<E> {
        {
            let mut state = self.state.lock();
            state.total_requests += 1;
            state.rejected_requests += 1;
        }
        tracing::warn!(breaker = %self.name, "Circuit breaker is OPEN, rejecting request");
        CircuitBreakerMetrics::record_call(&self.name, "rejected");
        ResilienceError::CircuitOpen {
            breaker: self.name.clone(),
        }
    }

    fn on_success(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        state.successful_requests += 1;
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        state.last_success_time = Some(Utc::now());
        tracing::debug!(
            breaker = %self.name,
            ?elapsed,
            "Circuit breaker call succeeded"
        );
        if state.state == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            state.transition(&self.name, CircuitState::Closed);
        }
        drop(state);
        CircuitBreakerMetrics::record_call(&self.name, "success");
    }

    fn on_failure(&self, kind: &'static str) {
        let mut state = self.state.lock();
        state.failed_requests += 1;
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        state.last_failure_time = Some(Utc::now());
        tracing::warn!(
            breaker = %self.name,
            error_kind = kind,
            consecutive_failures = state.consecutive_failures,
            "Circuit breaker call failed"
        );
        match state.state {
            CircuitState::Closed if state.consecutive_failures >= self.config.failure_threshold => {
                state.transition(&self.name, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                state.transition(&self.name, CircuitState::Open);
            }
            _ => {}
        }
        drop(state);
        CircuitBreakerMetrics::record_call(&self.name, "failure");
    }

    fn on_ignored(&self) {
        tracing::debug!(breaker = %self.name, "Error not counted by circuit breaker");
        CircuitBreakerMetrics::record_call(&self.name, "ignored");
    }

    /// Force the breaker Closed and clear the failure and success runs.
    ///
    /// Lifetime counters are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.transition(&self.name, CircuitState::Closed);
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.opened_at = None;
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
    }

    /// Force the breaker Open, starting a fresh recovery window.
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        state.transition(&self.name, CircuitState::Open);
        state.opened_at = Some(Instant::now());
        tracing::warn!(breaker = %self.name, "Circuit breaker manually forced to OPEN");
    }

    /// Snapshot of the breaker's counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        let success_rate = if state.total_requests == 0 {
            0.0
        } else {
            state.successful_requests as f64 / state.total_requests as f64
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rejected_requests: state.rejected_requests,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            state_changes: state.state_changes,
            success_rate,
            config: self.config.clone(),
        }
    }
}
