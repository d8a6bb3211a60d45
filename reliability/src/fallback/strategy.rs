//! Strategy implementations, one type per [`FallbackStrategy`] variant.

use super::FallbackStrategy;
use super::option::FallbackOption;
use crate::error::{FallbackError, ResilienceError};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rand::distributions::{Distribution, WeightedIndex};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What a strategy produced, before the manager adds timing and stats.
pub(crate) struct Attempted<T, E> {
    pub(crate) outcome: Result<T, FallbackError<E>>,
    pub(crate) executed_option: Option<String>,
    pub(crate) attempts_made: u32,
    pub(crate) fallback_used: bool,
    pub(crate) metadata: BTreeMap<String, Value>,
}

impl<T, E> Attempted<T, E> {
    fn new(kind: FallbackStrategy, outcome: Result<T, FallbackError<E>>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("strategy".to_string(), json!(kind.as_str()));
        Self {
            outcome,
            executed_option: None,
            attempts_made: 0,
            fallback_used: false,
            metadata,
        }
    }

    /// Every tried option failed, or nothing was eligible when `last` is `None`.
    fn exhausted(kind: FallbackStrategy, tried: u32, last: Option<ResilienceError<E>>) -> Self {
        let error = match last {
            Some(last) => FallbackError::Exhausted {
                tried: usize::try_from(tried).unwrap_or(usize::MAX),
                last,
            },
            None => FallbackError::NoEligibleOptions,
        };
        let mut attempted = Self::new(kind, Err(error));
        attempted.attempts_made = tried;
        attempted
    }

    fn executed(mut self, option: &str, attempts_made: u32) -> Self {
        self.executed_option = Some(option.to_string());
        self.attempts_made = attempts_made;
        self
    }

    const fn fallback_used(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Common interface over the four execution strategies.
#[async_trait]
pub(crate) trait Strategy<A, T, E>: Send + Sync
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Strategy kind, for stats and metadata.
    fn kind(&self) -> FallbackStrategy;

    /// Run `options` (a snapshot in registration order) against `args`.
    async fn execute(
        &self,
        manager: &str,
        options: &[Arc<FallbackOption<A, T, E>>],
        args: A,
    ) -> Attempted<T, E>;
}

/// Pick the strategy implementation for `kind`.
pub(crate) fn for_kind<A, T, E>(kind: FallbackStrategy) -> Box<dyn Strategy<A, T, E>>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    match kind {
        FallbackStrategy::Sequential => Box::new(Sequential),
        FallbackStrategy::Parallel => Box::new(Parallel),
        FallbackStrategy::Weighted => Box::new(Weighted),
        FallbackStrategy::Conditional => Box::new(Conditional),
    }
}

/// Registration order, first success wins.
pub(crate) struct Sequential;

#[async_trait]
impl<A, T, E> Strategy<A, T, E> for Sequential
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn kind(&self) -> FallbackStrategy {
        FallbackStrategy::Sequential
    }

    async fn execute(
        &self,
        manager: &str,
        options: &[Arc<FallbackOption<A, T, E>>],
        args: A,
    ) -> Attempted<T, E> {
        let mut tried = 0;
        let mut last = None;

        for (index, option) in options.iter().enumerate() {
            if !option.is_eligible(manager, &args) {
                continue;
            }
            tried += 1;
            match option.run(manager, args.clone()).await {
                Ok(value) => {
                    return Attempted::new(FallbackStrategy::Sequential, Ok(value))
                        .executed(&option.name, tried)
                        .with("option_index", json!(index))
                        .fallback_used(index > 0);
                }
                Err(err) => last = Some(err),
            }
        }

        Attempted::exhausted(FallbackStrategy::Sequential, tried, last)
    }
}

/// All eligible options at once, first success wins, the rest are dropped.
///
/// Polled through `FuturesUnordered` on the calling task; nothing is spawned.
pub(crate) struct Parallel;

#[async_trait]
impl<A, T, E> Strategy<A, T, E> for Parallel
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn kind(&self) -> FallbackStrategy {
        FallbackStrategy::Parallel
    }

    async fn execute(
        &self,
        manager: &str,
        options: &[Arc<FallbackOption<A, T, E>>],
        args: A,
    ) -> Attempted<T, E> {
        let eligible: Vec<(usize, &Arc<FallbackOption<A, T, E>>)> = options
            .iter()
            .enumerate()
            .filter(|(_, option)| option.is_eligible(manager, &args))
            .collect();
        let launched = u32::try_from(eligible.len()).unwrap_or(u32::MAX);

        let mut in_flight: FuturesUnordered<_> = eligible
            .into_iter()
            .map(|(index, option)| {
                let args = args.clone();
                async move { (index, option, option.run(manager, args).await) }
            })
            .collect();

        let mut last = None;
        while let Some((index, option, result)) = in_flight.next().await {
            match result {
                Ok(value) => {
                    // Dropping `in_flight` on return cancels the losers.
                    return Attempted::new(FallbackStrategy::Parallel, Ok(value))
                        .executed(&option.name, launched)
                        .with("option_index", json!(index))
                        .with("total_options", json!(launched));
                }
                Err(err) => last = Some(err),
            }
        }

        Attempted::exhausted(FallbackStrategy::Parallel, launched, last)
    }
}

/// One eligible option picked at random in proportion to its weight.
pub(crate) struct Weighted;

/// Index drawn from `weights`; the last one when the weights are unusable.
fn pick_weighted(weights: &[f64]) -> usize {
    let mut rng = rand::thread_rng();
    WeightedIndex::new(weights).map_or(weights.len().saturating_sub(1), |dist| {
        dist.sample(&mut rng)
    })
}

#[async_trait]
impl<A, T, E> Strategy<A, T, E> for Weighted
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn kind(&self) -> FallbackStrategy {
        FallbackStrategy::Weighted
    }

    async fn execute(
        &self,
        manager: &str,
        options: &[Arc<FallbackOption<A, T, E>>],
        args: A,
    ) -> Attempted<T, E> {
        let eligible: Vec<&Arc<FallbackOption<A, T, E>>> = options
            .iter()
            .filter(|option| option.is_eligible(manager, &args))
            .collect();
        if eligible.is_empty() {
            return Attempted::exhausted(FallbackStrategy::Weighted, 0, None);
        }

        let weights: Vec<f64> = eligible.iter().map(|option| option.weight).collect();
        let total_weight: f64 = weights.iter().sum();
        let selected = eligible[pick_weighted(&weights)];

        let attempted = match selected.run(manager, args).await {
            Ok(value) => Attempted::new(FallbackStrategy::Weighted, Ok(value)),
            Err(err) => Attempted::exhausted(FallbackStrategy::Weighted, 1, Some(err)),
        };
        attempted
            .executed(&selected.name, 1)
            .with("selected_weight", json!(selected.weight))
            .with("total_weight", json!(total_weight))
    }
}

/// First option whose precondition holds.
pub(crate) struct Conditional;

#[async_trait]
impl<A, T, E> Strategy<A, T, E> for Conditional
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn kind(&self) -> FallbackStrategy {
        FallbackStrategy::Conditional
    }

    async fn execute(
        &self,
        manager: &str,
        options: &[Arc<FallbackOption<A, T, E>>],
        args: A,
    ) -> Attempted<T, E> {
        let mut condition_met = false;
        let mut selected = None;
        for option in options {
            if !option.condition_holds(&args) {
                continue;
            }
            condition_met = true;
            if option.is_eligible(manager, &args) {
                selected = Some(option);
                break;
            }
        }

        let Some(option) = selected else {
            let error = if condition_met || options.is_empty() {
                FallbackError::NoEligibleOptions
            } else {
                FallbackError::NoConditionMet
            };
            return Attempted::new(FallbackStrategy::Conditional, Err(error))
                .with("condition_met", json!(condition_met));
        };

        let attempted = match option.run(manager, args).await {
            Ok(value) => Attempted::new(FallbackStrategy::Conditional, Ok(value)),
            Err(err) => Attempted::exhausted(FallbackStrategy::Conditional, 1, Some(err)),
        };
        attempted
            .executed(&option.name, 1)
            .with("condition_met", json!(true))
    }
}
