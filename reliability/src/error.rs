//! Error types shared by every primitive in this crate.
//!
//! The key distinction is between "we never tried" ([`ResilienceError::CircuitOpen`])
//! and "we tried and it failed" ([`ResilienceError::Timeout`],
//! [`ResilienceError::Inner`]). Callers that only care about the
//! operation's own error can use [`ResilienceError::into_inner`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Predicate over an operation's own error type.
///
/// Used to classify errors as retryable, fatal, or counted by a circuit breaker.
pub type ErrorFilter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Errors produced when running an operation through a resilience primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError<E> {
    /// The circuit breaker rejected the call without invoking the operation.
    #[error("circuit breaker '{breaker}' is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        breaker: String,
    },
    /// The operation did not finish within its time bound and was abandoned.
    #[error("operation timed out after {after:?}")]
    Timeout {
        /// The bound that was exceeded
        after: Duration,
    },
    /// The operation ran and returned its own error.
    #[error("operation failed: {0}")]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Short, stable label for this error kind (used in stats and metrics).
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::Inner(_) => "operation",
        }
    }

    /// Whether the operation was never invoked because a breaker was open.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether the operation was abandoned after exceeding its time bound.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Borrow the operation's own error, if that is what happened.
    #[must_use]
    pub const fn inner(&self) -> Option<&E> {
        match self {
            Self::Inner(err) => Some(err),
            _ => None,
        }
    }

    /// Take the operation's own error, if that is what happened.
    #[must_use]
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors produced by a [`FallbackManager`](crate::fallback::FallbackManager).
///
/// Total exhaustion surfaces as one aggregate failure naming the last error
/// and how many options were actually tried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FallbackError<E> {
    /// No option was eligible (none registered, all breakers open, or all
    /// preconditions false). Nothing was invoked.
    #[error("no eligible fallback options")]
    NoEligibleOptions,
    /// Conditional strategy found no option whose precondition holds.
    #[error("no fallback condition met")]
    NoConditionMet,
    /// Every option that was tried failed.
    #[error("all {tried} fallback option(s) failed; last error: {last}")]
    Exhausted {
        /// Number of options that were invoked
        tried: usize,
        /// Error from the last option to fail
        last: ResilienceError<E>,
    },
}

impl<E> FallbackError<E> {
    /// The last underlying error, if any option was actually tried.
    #[must_use]
    pub const fn last_error(&self) -> Option<&ResilienceError<E>> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}
