//! # c0r reliability testing
//!
//! Test helpers for code built on `c0r-reliability`:
//!
//! - [`TestError`]: an error type with a transient/fatal split for retry and
//!   breaker classification
//! - [`ScriptedOperation`]: an operation that follows a script of outcomes
//!   and counts its calls
//! - [`probes`]: canned health probes
//! - [`init_test_tracing`]: log output for failing tests
//!
//! ## Example
//!
//! ```rust
//! use c0r_reliability_testing::{ScriptedOperation, TestError};
//!
//! # async fn example() {
//! let provider = ScriptedOperation::new()
//!     .then_fail_times(2, TestError::transient("503"))
//!     .then_ok("420 kcal".to_string());
//! let op = provider.operation::<String>();
//!
//! assert!(op("lunch.jpg".to_string()).await.is_err());
//! assert!(op("lunch.jpg".to_string()).await.is_err());
//! assert_eq!(op("lunch.jpg".to_string()).await.unwrap(), "420 kcal");
//! assert_eq!(provider.calls(), 3);
//! # }
//! ```

use c0r_reliability::operation::{Operation, operation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Error returned by scripted operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TestError {
    /// Worth retrying (rate limit, 503, connection reset)
    #[error("transient: {0}")]
    Transient(String),
    /// Not worth retrying (bad request, invalid image)
    #[error("fatal: {0}")]
    Fatal(String),
}

impl TestError {
    /// Create a transient error
    #[must_use]
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error
    #[must_use]
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Check if the error is transient
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Check if the error is fatal
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Step<T> {
    /// Return the value
    Succeed(T),
    /// Return the error
    Fail(TestError),
    /// Sleep, then return the value
    SucceedAfter(Duration, T),
    /// Sleep, then return the error
    FailAfter(Duration, TestError),
}

impl<T> Step<T> {
    async fn perform(self) -> Result<T, TestError> {
        match self {
            Self::Succeed(value) => Ok(value),
            Self::Fail(err) => Err(err),
            Self::SucceedAfter(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Self::FailAfter(delay, err) => {
                tokio::time::sleep(delay).await;
                Err(err)
            }
        }
    }
}

struct Script<T> {
    steps: Mutex<VecDeque<Step<T>>>,
    calls: AtomicU32,
}

/// An operation that plays back a script of outcomes.
///
/// Steps are consumed in order; the last step repeats forever. An empty
/// script fails every call with a fatal "empty script" error.
pub struct ScriptedOperation<T> {
    script: Arc<Script<T>>,
}

impl<T> Clone for ScriptedOperation<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ScriptedOperation<T> {
    /// Create an empty script
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script {
                steps: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            }),
        }
    }

    /// Operation that always returns `value`
    #[must_use]
    pub fn always_ok(value: T) -> Self {
        Self::new().then_ok(value)
    }

    /// Operation that always fails with `err`
    #[must_use]
    pub fn always_fail(err: TestError) -> Self {
        Self::new().then_fail(err)
    }

    /// Operation that always returns `value` after `delay`
    #[must_use]
    pub fn slow(delay: Duration, value: T) -> Self {
        Self::new().then(Step::SucceedAfter(delay, value))
    }

    /// Append a step
    #[must_use]
    pub fn then(self, step: Step<T>) -> Self {
        self.script.steps.lock().push_back(step);
        self
    }

    /// Append a success
    #[must_use]
    pub fn then_ok(self, value: T) -> Self {
        self.then(Step::Succeed(value))
    }

    /// Append a failure
    #[must_use]
    pub fn then_fail(self, err: TestError) -> Self {
        self.then(Step::Fail(err))
    }

    /// Append `times` identical failures
    #[must_use]
    pub fn then_fail_times(self, times: u32, err: TestError) -> Self {
        (0..times).fold(self, |script, _| script.then_fail(err.clone()))
    }

    /// Number of times the operation was invoked
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step<T> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let mut steps = self.script.steps.lock();
        let step = if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        };
        step.unwrap_or_else(|| Step::Fail(TestError::fatal("empty script")))
    }

    /// The script as an operation taking (and ignoring) arguments `A`.
    ///
    /// The step is taken when the operation is called, so the call counter
    /// includes calls whose future was later dropped.
    #[must_use]
    pub fn operation<A>(&self) -> Operation<A, T, TestError> {
        let script = self.clone();
        operation(move |_args: A| {
            let step = script.next_step();
            step.perform()
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ScriptedOperation<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Canned health probes.
pub mod probes {
    use c0r_reliability::health::{HealthProbe, ProbeReport, probe_fn};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Always reports healthy
    #[must_use]
    pub fn healthy() -> Arc<dyn HealthProbe> {
        probe_fn(|| async { Ok(ProbeReport::healthy("ok")) })
    }

    /// Always reports degraded with `message`
    #[must_use]
    pub fn degraded(message: &'static str) -> Arc<dyn HealthProbe> {
        probe_fn(move || async move { Ok(ProbeReport::degraded(message)) })
    }

    /// Always reports unhealthy with `message`
    #[must_use]
    pub fn unhealthy(message: &'static str) -> Arc<dyn HealthProbe> {
        probe_fn(move || async move { Ok(ProbeReport::unhealthy(message)) })
    }

    /// Always returns an error
    #[must_use]
    pub fn failing(message: &'static str) -> Arc<dyn HealthProbe> {
        probe_fn(move || async move { Err(anyhow::anyhow!(message)) })
    }

    /// Reports healthy after sleeping `delay`
    #[must_use]
    pub fn slow(delay: Duration) -> Arc<dyn HealthProbe> {
        probe_fn(move || async move {
            tokio::time::sleep(delay).await;
            Ok(ProbeReport::healthy("slow but ok"))
        })
    }

    /// Healthy probe that counts its runs in `calls`
    #[must_use]
    pub fn counting(calls: Arc<AtomicU32>) -> Arc<dyn HealthProbe> {
        probe_fn(move || {
            let calls = Arc::clone(&calls);
            async move {
                let run = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(ProbeReport::healthy("ok").with_detail("run", run))
            }
        })
    }
}

/// Install a `tracing` subscriber writing to the test harness output.
///
/// Honors `RUST_LOG` and defaults to `debug` for the reliability crate. Safe
/// to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,c0r_reliability=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
