//! Fallback chains over interchangeable operations.
//!
//! A [`FallbackManager`] owns an ordered set of options for one logical task
//! ("analyze this food photo") and produces a single result by running them
//! according to a [`FallbackStrategy`] chosen at construction:
//!
//! - **Sequential**: registration order, first success wins.
//! - **Parallel**: every eligible option at once, first success wins and the
//!   others are cancelled.
//! - **Weighted**: one eligible option, picked in proportion to its weight.
//! - **Conditional**: the first option whose precondition holds.
//!
//! An option is eligible when its circuit breaker would admit a call and its
//! precondition (if any) holds. Skipped options never count as attempts.
//! [`FallbackManager::execute`] never fails; total exhaustion comes back as
//! [`FallbackError::Exhausted`] inside the [`FallbackResult`].
//!
//! # Example
//!
//! ```rust
//! use c0r_reliability::fallback::{FallbackManager, FallbackStrategy, OptionSpec};
//! use c0r_reliability::operation::operation;
//!
//! # async fn example() {
//! let manager = FallbackManager::new("food-analysis", FallbackStrategy::Sequential);
//! manager
//!     .add_option(OptionSpec::new(
//!         "openai-vision",
//!         operation(|_image: String| async { Err::<String, _>("rate limited".to_string()) }),
//!     ))
//!     .add_option(OptionSpec::new(
//!         "gemini-vision",
//!         operation(|image: String| async move { Ok::<_, String>(format!("{image}: 420 kcal")) }),
//!     ));
//!
//! let result = manager.execute("lunch.jpg".to_string()).await;
//! assert_eq!(result.executed_option.as_deref(), Some("gemini-vision"));
//! assert!(result.fallback_used);
//! # }
//! ```

mod option;
mod strategy;

pub use option::{OptionSpec, OptionStats, Precondition};

use option::FallbackOption;

use crate::error::FallbackError;
use crate::metrics::FallbackMetrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strategy::Strategy;
use tokio::time::Instant;

/// How a manager runs its options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Registration order, first success wins
    #[default]
    Sequential,
    /// All eligible options concurrently, first success wins
    ///
    /// Options are polled together on the caller's task rather than spawned,
    /// so they overlap while awaiting I/O but CPU-bound work in one option
    /// blocks the others. Losers are dropped once a winner returns, and
    /// dropping the `execute` future cancels every option still in flight.
    Parallel,
    /// One option chosen by weight
    Weighted,
    /// First option whose precondition holds
    Conditional,
}

impl FallbackStrategy {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Weighted => "weighted",
            Self::Conditional => "conditional",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`FallbackManager::execute`].
#[derive(Debug)]
pub struct FallbackResult<T, E> {
    /// Value from the winning option, or why there was none
    pub outcome: Result<T, FallbackError<E>>,
    /// Option that produced the outcome, when a single one can be named
    pub executed_option: Option<String>,
    /// Options actually run (skipped options don't count)
    pub attempts_made: u32,
    /// Wall time of the whole execution
    pub execution_time: Duration,
    /// Whether a non-primary option produced the value
    pub fallback_used: bool,
    /// Strategy details (`strategy`, `option_index`, weights, ...)
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl<T, E> FallbackResult<T, E> {
    /// Whether some option produced a value.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Borrow the value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// Borrow the error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&FallbackError<E>> {
        self.outcome.as_ref().err()
    }

    /// Convert into a plain result.
    ///
    /// # Errors
    ///
    /// Returns the aggregate failure when no option succeeded.
    pub fn into_result(self) -> Result<T, FallbackError<E>> {
        self.outcome
    }
}

/// Snapshot of a manager's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStats {
    /// Manager name
    pub name: String,
    /// Strategy in use
    pub strategy: FallbackStrategy,
    /// Executions started
    pub total_executions: u64,
    /// Executions that produced a value
    pub successful_executions: u64,
    /// Successful executions served by a non-primary option
    pub fallback_executions: u64,
    /// `successful_executions / total_executions`
    pub success_rate: f64,
    /// `fallback_executions / successful_executions`
    pub fallback_rate: f64,
    /// Registered options
    pub options_count: usize,
    /// Per-option stats in registration order
    pub option_stats: Vec<OptionStats>,
}

#[derive(Debug, Default)]
struct ManagerCounters {
    total_executions: u64,
    successful_executions: u64,
    fallback_executions: u64,
}

/// Orchestrates a set of alternative options for one logical task.
pub struct FallbackManager<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    name: String,
    strategy: Box<dyn Strategy<A, T, E>>,
    options: RwLock<Vec<Arc<FallbackOption<A, T, E>>>>,
    counters: Mutex<ManagerCounters>,
}

impl<A, T, E> fmt::Debug for FallbackManager<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackManager")
            .field("name", &self.name)
            .field("strategy", &self.strategy.kind())
            .field("options", &self.option_names())
            .finish_non_exhaustive()
    }
}

impl<A, T, E> FallbackManager<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Create an empty manager.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FallbackStrategy) -> Self {
        let name = name.into();
        tracing::info!(manager = %name, strategy = %kind, "Fallback manager initialized");
        Self {
            name,
            strategy: strategy::for_kind(kind),
            options: RwLock::new(Vec::new()),
            counters: Mutex::new(ManagerCounters::default()),
        }
    }

    /// Manager name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Strategy chosen at construction.
    #[must_use]
    pub fn strategy(&self) -> FallbackStrategy {
        self.strategy.kind()
    }

    /// Register an option at the end of the chain.
    ///
    /// Owned breakers and retry handlers are named `{manager}_{option}`.
    pub fn add_option(&self, spec: OptionSpec<A, T, E>) -> &Self {
        let option = spec.into_option(&self.name);
        tracing::info!(
            manager = %self.name,
            option = %option.name,
            weight = option.weight,
            "Fallback option added"
        );
        self.options.write().push(Arc::new(option));
        self
    }

    /// Remove the first option called `name`. Returns whether one was removed.
    pub fn remove_option(&self, name: &str) -> bool {
        let mut options = self.options.write();
        let Some(position) = options.iter().position(|option| option.name == name) else {
            return false;
        };
        options.remove(position);
        drop(options);
        tracing::info!(manager = %self.name, option = %name, "Fallback option removed");
        true
    }

    /// Remove every option.
    pub fn clear_options(&self) {
        self.options.write().clear();
        tracing::info!(manager = %self.name, "All fallback options cleared");
    }

    /// Number of registered options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.options.read().len()
    }

    /// Whether no options are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.read().is_empty()
    }

    /// Option names in registration order.
    #[must_use]
    pub fn option_names(&self) -> Vec<String> {
        self.options
            .read()
            .iter()
            .map(|option| option.name.clone())
            .collect()
    }

    /// Metadata attached to an option.
    #[must_use]
    pub fn option_metadata(&self, name: &str) -> Option<BTreeMap<String, serde_json::Value>> {
        self.options
            .read()
            .iter()
            .find(|option| option.name == name)
            .map(|option| option.metadata.clone())
    }

    /// Run the chain against `args`. Never fails; see [`FallbackResult`].
    ///
    /// Dropping the returned future cancels whichever options are running.
    pub async fn execute(&self, args: A) -> FallbackResult<T, E> {
        let started = Instant::now();
        let options: Vec<Arc<FallbackOption<A, T, E>>> = self.options.read().clone();
        self.counters.lock().total_executions += 1;

        tracing::debug!(
            manager = %self.name,
            strategy = %self.strategy.kind(),
            options = options.len(),
            "Executing fallback chain"
        );

        let attempted = self.strategy.execute(&self.name, &options, args).await;
        let execution_time = started.elapsed();

        let outcome_label = match &attempted.outcome {
            Ok(_) if attempted.fallback_used => "fallback",
            Ok(_) => "primary",
            Err(_) => "failed",
        };
        {
            let mut counters = self.counters.lock();
            if attempted.outcome.is_ok() {
                counters.successful_executions += 1;
                if attempted.fallback_used {
                    counters.fallback_executions += 1;
                }
            }
        }
        FallbackMetrics::record_execution(&self.name, outcome_label);

        match &attempted.outcome {
            Ok(_) if attempted.fallback_used => tracing::info!(
                manager = %self.name,
                option = attempted.executed_option.as_deref().unwrap_or_default(),
                attempts = attempted.attempts_made,
                "Fallback option served the request"
            ),
            Ok(_) => {}
            Err(err) => tracing::error!(
                manager = %self.name,
                attempts = attempted.attempts_made,
                error = %err,
                "Fallback chain failed"
            ),
        }

        FallbackResult {
            outcome: attempted.outcome,
            executed_option: attempted.executed_option,
            attempts_made: attempted.attempts_made,
            execution_time,
            fallback_used: attempted.fallback_used,
            metadata: attempted.metadata,
        }
    }

    /// Snapshot of the manager and per-option counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> FallbackStats {
        let option_stats: Vec<OptionStats> =
            self.options.read().iter().map(|option| option.stats()).collect();
        let counters = self.counters.lock();
        let ratio = |part: u64, whole: u64| {
            if whole == 0 {
                0.0
            } else {
                part as f64 / whole as f64
            }
        };
        FallbackStats {
            name: self.name.clone(),
            strategy: self.strategy.kind(),
            total_executions: counters.total_executions,
            successful_executions: counters.successful_executions,
            fallback_executions: counters.fallback_executions,
            success_rate: ratio(counters.successful_executions, counters.total_executions),
            fallback_rate: ratio(counters.fallback_executions, counters.successful_executions),
            options_count: option_stats.len(),
            option_stats,
        }
    }

    /// Zero the manager and per-option counters.
    pub fn reset_stats(&self) {
        *self.counters.lock() = ManagerCounters::default();
        for option in self.options.read().iter() {
            option.reset_stats();
        }
        tracing::info!(manager = %self.name, "Fallback manager stats reset");
    }
}
