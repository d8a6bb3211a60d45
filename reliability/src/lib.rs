//! Resilience layer for calls to unreliable model providers.
//!
//! Every call to a remote vision or language model (and to the database that
//! stores its results) is routed through composable primitives:
//!
//! - [`circuit_breaker`]: stop calling a component that keeps failing, probe
//!   it again after a recovery window
//! - [`retry`]: re-run failed attempts with fixed, exponential, linear,
//!   jittered or Fibonacci backoff
//! - [`fallback`]: try alternative providers sequentially, in parallel, by
//!   weight, or by precondition
//! - [`health`]: periodic probes aggregated into an overall status
//! - [`registry`]: named, shared instances of the above
//!
//! The layer never looks inside an operation. Callers hand it opaque async
//! callables built with [`operation::operation`] and compose protection with
//! [`operation::GuardedOperation`].
//!
//! ## Ambient concerns
//!
//! - Logging through `tracing`, with the component name on every event
//! - Metrics through the `metrics` facade, exported by [`metrics::MetricsExporter`]
//! - Settings from TOML and the environment via [`config::ReliabilitySettings`]
//!
//! ## Example
//!
//! ```rust
//! use c0r_reliability::fallback::{FallbackManager, FallbackStrategy, OptionSpec};
//! use c0r_reliability::circuit_breaker::CircuitBreakerConfig;
//! use c0r_reliability::operation::operation;
//!
//! # async fn example() {
//! let manager = FallbackManager::new("meal_analysis", FallbackStrategy::Sequential);
//! manager
//!     .add_option(
//!         OptionSpec::new(
//!             "openai-vision",
//!             operation(|photo: String| async move { Err::<String, _>(format!("{photo}: rate limited")) }),
//!         )
//!         .circuit_breaker(CircuitBreakerConfig::default()),
//!     )
//!     .add_option(OptionSpec::new(
//!         "cached-estimate",
//!         operation(|_photo: String| async move { Ok::<_, String>("~500 kcal".to_string()) }),
//!     ));
//!
//! let result = manager.execute("breakfast.jpg".to_string()).await;
//! assert_eq!(result.value().map(String::as_str), Some("~500 kcal"));
//! assert!(result.fallback_used);
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod operation;
pub mod registry;
pub mod retry;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::{ConfigError, Environment, ReliabilitySettings};
pub use error::{FallbackError, ResilienceError};
pub use fallback::{FallbackManager, FallbackResult, FallbackStats, FallbackStrategy, OptionSpec};
pub use health::{
    HealthCheckConfig, HealthCheckResult, HealthMonitor, HealthProbe, HealthReport, HealthStatus,
    MemoryProbe, ProbeReport, connectivity_probe, probe_fn,
};
pub use metrics::{MetricsError, MetricsExporter};
pub use operation::{GuardedOperation, Operation, operation};
pub use registry::{CircuitBreakerRegistry, FallbackManagerRegistry, RetryHandlerRegistry};
pub use retry::{RetryConfig, RetryHandler, RetryResult, RetryStats, RetryStrategy};
