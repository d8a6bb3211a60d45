//! Operations and their guarded composition.
//!
//! An [`Operation`] is an opaque async callable supplied by a collaborator
//! (a provider client, a database accessor). The resilience layer never looks
//! inside it. A [`GuardedOperation`] is built once from an operation plus an
//! optional timeout, circuit breaker and retry handler, and invoked uniformly:
//!
//! ```text
//! retry ( breaker ( timeout ( operation(args) ) ) )
//! ```
//!
//! # Example
//!
//! ```rust
//! use c0r_reliability::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use c0r_reliability::operation::{operation, GuardedOperation};
//! use c0r_reliability::retry::{RetryConfig, RetryHandler};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let analyze = operation(|image: String| async move {
//!     Ok::<_, String>(format!("analysis of {image}"))
//! });
//!
//! let guarded = GuardedOperation::new("analyze", analyze)
//!     .with_circuit_breaker(Arc::new(CircuitBreaker::new(
//!         "analyze",
//!         CircuitBreakerConfig::default(),
//!     )))
//!     .with_retry(Arc::new(RetryHandler::new("analyze", RetryConfig::default())));
//!
//! let result = guarded.call("meal.jpg".to_string()).await;
//! assert!(result.is_ok());
//! # }
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ErrorFilter, ResilienceError};
use crate::retry::{RetryHandler, RetryResult};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared async callable taking arguments `A`.
pub type Operation<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Build an [`Operation`] from an async closure.
pub fn operation<A, T, E, F, Fut>(f: F) -> Operation<A, T, E>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// Run `operation` once, bounded by `timeout` if one is set.
pub(crate) async fn run_once<A, T, E>(
    operation: &Operation<A, T, E>,
    timeout: Option<Duration>,
    args: A,
) -> Result<T, ResilienceError<E>> {
    let attempt = operation(args);
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result.map_err(ResilienceError::Inner),
            Err(_) => Err(ResilienceError::Timeout { after: limit }),
        },
        None => attempt.await.map_err(ResilienceError::Inner),
    }
}

/// An operation composed with its protection, built once and invoked many times.
pub struct GuardedOperation<A, T, E> {
    name: String,
    operation: Operation<A, T, E>,
    timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
    breaker_counts: Option<ErrorFilter<E>>,
    retry: Option<Arc<RetryHandler<E>>>,
}

impl<A, T, E> Clone for GuardedOperation<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            operation: Arc::clone(&self.operation),
            timeout: self.timeout,
            breaker: self.breaker.clone(),
            breaker_counts: self.breaker_counts.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<A, T, E> fmt::Debug for GuardedOperation<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedOperation")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .field("retry", &self.retry.as_ref().map(|r| r.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl<A, T, E> GuardedOperation<A, T, E> {
    /// Wrap an unprotected operation.
    #[must_use]
    pub fn new(name: impl Into<String>, operation: Operation<A, T, E>) -> Self {
        Self {
            name: name.into(),
            operation,
            timeout: None,
            breaker: None,
            breaker_counts: None,
            retry: None,
        }
    }

    /// Bound each attempt by `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Route each attempt through `breaker`.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Only count operation errors matching `filter` against the breaker.
    #[must_use]
    pub fn breaker_counts(mut self, filter: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.breaker_counts = Some(Arc::new(filter));
        self
    }

    /// Retry attempts with `handler`.
    #[must_use]
    pub fn with_retry(mut self, handler: Arc<RetryHandler<E>>) -> Self {
        self.retry = Some(handler);
        self
    }

    /// Operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker guarding this operation, if any.
    #[must_use]
    pub const fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// The retry handler for this operation, if any.
    #[must_use]
    pub const fn retry_handler(&self) -> Option<&Arc<RetryHandler<E>>> {
        self.retry.as_ref()
    }

    /// Whether the breaker (if any) would admit a call right now.
    #[must_use]
    pub fn is_call_permitted(&self) -> bool {
        self.breaker
            .as_ref()
            .is_none_or(|breaker| breaker.is_call_permitted())
    }

    async fn attempt(&self, args: A) -> Result<T, ResilienceError<E>> {
        match &self.breaker {
            Some(breaker) => {
                breaker
                    .guard(
                        || run_once(&self.operation, self.timeout, args),
                        |err| {
                            self.breaker_counts
                                .as_ref()
                                .is_none_or(|counts| counts(err))
                        },
                    )
                    .await
            }
            None => run_once(&self.operation, self.timeout, args).await,
        }
    }
}

impl<A: Clone, T, E: fmt::Display> GuardedOperation<A, T, E> {
    /// Run the composed operation, returning the full attempt trace.
    pub async fn invoke(&self, args: A) -> RetryResult<T, E> {
        match &self.retry {
            Some(retry) => retry.execute_guarded(|| self.attempt(args.clone())).await,
            None => {
                let started = Instant::now();
                let outcome = self.attempt(args).await;
                RetryResult::single(outcome, started.elapsed())
            }
        }
    }

    /// Run the composed operation and return its final result.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error: the operation's own error, a
    /// timeout, or a circuit-open rejection.
    pub async fn call(&self, args: A) -> Result<T, ResilienceError<E>> {
        self.invoke(args).await.into_result()
    }
}
