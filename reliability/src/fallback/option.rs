//! Fallback options: one alternative way to satisfy a request.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::ResilienceError;
use crate::metrics::FallbackMetrics;
use crate::operation::{GuardedOperation, Operation};
use crate::retry::{RetryConfig, RetryHandler, RetryStrategy};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Predicate deciding whether an option applies to the given arguments.
pub type Precondition<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;

enum BreakerSpec {
    None,
    Owned(CircuitBreakerConfig),
    Shared(Arc<CircuitBreaker>),
}

enum RetrySpec {
    None,
    Count(u32),
    Config(RetryConfig),
}

/// Description of an option, materialized by
/// [`FallbackManager::add_option`](super::FallbackManager::add_option).
///
/// # Example
///
/// ```rust
/// use c0r_reliability::circuit_breaker::CircuitBreakerConfig;
/// use c0r_reliability::fallback::OptionSpec;
/// use c0r_reliability::operation::operation;
/// use std::time::Duration;
///
/// let spec = OptionSpec::new(
///     "gemini-vision",
///     operation(|image: String| async move { Ok::<_, String>(image.len()) }),
/// )
/// .weight(2.0)
/// .precondition(|image: &String| !image.is_empty())
/// .circuit_breaker(CircuitBreakerConfig::default())
/// .timeout(Duration::from_secs(20))
/// .retry_count(2)
/// .metadata("provider", "google");
/// ```
pub struct OptionSpec<A, T, E> {
    name: String,
    operation: Operation<A, T, E>,
    weight: f64,
    precondition: Option<Precondition<A>>,
    breaker: BreakerSpec,
    timeout: Option<Duration>,
    retry: RetrySpec,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl<A, T, E> OptionSpec<A, T, E> {
    /// Start describing an option with weight 1.0 and no protection.
    #[must_use]
    pub fn new(name: impl Into<String>, operation: Operation<A, T, E>) -> Self {
        Self {
            name: name.into(),
            operation,
            weight: 1.0,
            precondition: None,
            breaker: BreakerSpec::None,
            timeout: None,
            retry: RetrySpec::None,
            metadata: BTreeMap::new(),
        }
    }

    /// Relative selection weight for the weighted strategy.
    #[must_use]
    pub const fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Only consider this option when `condition` holds for the arguments.
    #[must_use]
    pub fn precondition(mut self, condition: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.precondition = Some(Arc::new(condition));
        self
    }

    /// Give the option its own breaker, named `{manager}_{option}`.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = BreakerSpec::Owned(config);
        self
    }

    /// Share an existing breaker, e.g. one from a
    /// [`CircuitBreakerRegistry`](crate::registry::CircuitBreakerRegistry).
    #[must_use]
    pub fn shared_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = BreakerSpec::Shared(breaker);
        self
    }

    /// Bound each attempt of this option.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry a failing attempt up to `retries` more times with exponential
    /// backoff (1 s, doubling, capped at 10 s, no jitter).
    #[must_use]
    pub fn retry_count(mut self, retries: u32) -> Self {
        self.retry = RetrySpec::Count(retries);
        self
    }

    /// Retry with a full retry configuration.
    #[must_use]
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = RetrySpec::Config(config);
        self
    }

    /// Attach free-form metadata.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Option name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_option(self, manager: &str) -> FallbackOption<A, T, E> {
        let component = format!("{manager}_{}", self.name);

        let mut guarded = GuardedOperation::new(self.name.clone(), self.operation);
        if let Some(timeout) = self.timeout {
            guarded = guarded.with_timeout(timeout);
        }
        match self.breaker {
            BreakerSpec::None => {}
            BreakerSpec::Owned(config) => {
                guarded =
                    guarded.with_circuit_breaker(Arc::new(CircuitBreaker::new(&component, config)));
            }
            BreakerSpec::Shared(breaker) => guarded = guarded.with_circuit_breaker(breaker),
        }
        let retry = match self.retry {
            RetrySpec::None | RetrySpec::Count(0) => None,
            RetrySpec::Count(retries) => Some(option_retry_config(retries)),
            RetrySpec::Config(config) => Some(config),
        };
        if let Some(config) = retry {
            guarded = guarded.with_retry(Arc::new(RetryHandler::new(component, config)));
        }

        FallbackOption {
            name: self.name,
            weight: self.weight,
            precondition: self.precondition,
            guarded,
            metadata: self.metadata,
            counters: Mutex::new(OptionCounters::default()),
        }
    }
}

fn option_retry_config(retries: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(retries.saturating_add(1))
        .base_delay(Duration::from_secs(1))
        .backoff_multiplier(2.0)
        .max_delay(Duration::from_secs(10))
        .strategy(RetryStrategy::Exponential)
        .jitter(false)
        .build()
}

/// Per-option execution statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionStats {
    /// Option name
    pub name: String,
    /// Selection weight
    pub weight: f64,
    /// Times the option was started (retries count once)
    pub invocations: u64,
    /// Runs that produced a value
    pub successes: u64,
    /// Runs that ended in an error
    pub failures: u64,
    /// Mean latency over finished runs
    pub average_latency: Duration,
}

#[derive(Debug, Default)]
struct OptionCounters {
    invocations: u64,
    successes: u64,
    failures: u64,
    total_latency: Duration,
}

/// A materialized option owned by one manager.
pub struct FallbackOption<A, T, E> {
    pub(crate) name: String,
    pub(crate) weight: f64,
    precondition: Option<Precondition<A>>,
    guarded: GuardedOperation<A, T, E>,
    pub(crate) metadata: BTreeMap<String, serde_json::Value>,
    counters: Mutex<OptionCounters>,
}

impl<A, T, E> fmt::Debug for FallbackOption<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackOption")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("precondition", &self.precondition.is_some())
            .field("guarded", &self.guarded)
            .finish_non_exhaustive()
    }
}

impl<A, T, E> FallbackOption<A, T, E> {
    /// Whether the option's precondition (if any) holds.
    pub(crate) fn condition_holds(&self, args: &A) -> bool {
        self.precondition
            .as_ref()
            .is_none_or(|condition| condition(args))
    }

    /// Breaker permits a call now and the precondition holds.
    pub(crate) fn is_eligible(&self, manager: &str, args: &A) -> bool {
        if !self.guarded.is_call_permitted() {
            tracing::debug!(manager = %manager, option = %self.name, "Option skipped, circuit breaker is open");
            return false;
        }
        if !self.condition_holds(args) {
            tracing::debug!(manager = %manager, option = %self.name, "Option skipped, condition not met");
            return false;
        }
        true
    }

    pub(crate) fn stats(&self) -> OptionStats {
        let counters = self.counters.lock();
        let finished = counters.successes + counters.failures;
        let average_latency = if finished == 0 {
            Duration::ZERO
        } else {
            counters
                .total_latency
                .checked_div(u32::try_from(finished).unwrap_or(u32::MAX))
                .unwrap_or_default()
        };
        OptionStats {
            name: self.name.clone(),
            weight: self.weight,
            invocations: counters.invocations,
            successes: counters.successes,
            failures: counters.failures,
            average_latency,
        }
    }

    pub(crate) fn reset_stats(&self) {
        *self.counters.lock() = OptionCounters::default();
    }
}

impl<A: Clone, T, E: fmt::Display> FallbackOption<A, T, E> {
    /// Run the option with its breaker, timeout and retries.
    pub(crate) async fn run(&self, manager: &str, args: A) -> Result<T, ResilienceError<E>> {
        self.counters.lock().invocations += 1;
        let started = Instant::now();

        let result = self.guarded.invoke(args).await;
        let elapsed = started.elapsed();

        {
            let mut counters = self.counters.lock();
            counters.total_latency += elapsed;
            if result.is_success() {
                counters.successes += 1;
            } else {
                counters.failures += 1;
            }
        }
        FallbackMetrics::record_option(manager, &self.name, elapsed);

        match &result.outcome {
            Ok(_) => tracing::debug!(
                manager = %manager,
                option = %self.name,
                attempts = result.attempts_made,
                elapsed_ms = elapsed.as_millis(),
                "Option succeeded"
            ),
            Err(err) => tracing::warn!(
                manager = %manager,
                option = %self.name,
                attempts = result.attempts_made,
                error = %err,
                "Option failed"
            ),
        }
        result.into_result()
    }
}
