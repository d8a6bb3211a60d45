//! Named registries of breakers, retry handlers and fallback managers.
//!
//! Registries are plain values owned by the application's composition root
//! and shared by `Arc`. Every registry is safe to use from many tasks at once;
//! lookups hand out `Arc` clones so no lock is held while a component runs.
//!
//! # Example
//!
//! ```rust
//! use c0r_reliability::circuit_breaker::CircuitBreakerConfig;
//! use c0r_reliability::registry::CircuitBreakerRegistry;
//! use std::sync::Arc;
//!
//! let breakers = CircuitBreakerRegistry::new();
//! let vision = breakers.get_or_create("openai-vision", Some(CircuitBreakerConfig::default()));
//! let again = breakers.get_or_create("openai-vision", None);
//! assert!(Arc::ptr_eq(&vision, &again));
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::fallback::{FallbackManager, FallbackStats, FallbackStrategy};
use crate::retry::{RetryConfig, RetryHandler, RetryStats};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name-keyed map of shared components.
struct NamedRegistry<V: ?Sized> {
    entries: RwLock<BTreeMap<String, Arc<V>>>,
}

impl<V: ?Sized> NamedRegistry<V> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn get(&self, name: &str) -> Option<Arc<V>> {
        self.entries.read().get(name).cloned()
    }

    /// Existing entry for `name`, or the one built by `create`. The flag is
    /// `true` when `create` ran.
    fn get_or_insert_with(&self, name: &str, create: impl FnOnce() -> Arc<V>) -> (Arc<V>, bool) {
        if let Some(existing) = self.get(name) {
            return (existing, false);
        }
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            return (Arc::clone(existing), false);
        }
        let created = create();
        entries.insert(name.to_string(), Arc::clone(&created));
        (created, true)
    }

    fn remove(&self, name: &str) -> Option<Arc<V>> {
        self.entries.write().remove(name)
    }

    fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn snapshot(&self) -> Vec<Arc<V>> {
        self.entries.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Circuit breakers by name.
pub struct CircuitBreakerRegistry {
    breakers: NamedRegistry<CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            breakers: NamedRegistry::new(),
        }
    }

    /// The breaker named `name`, created with `config` (or the default
    /// configuration) if it does not exist yet. An existing breaker is returned
    /// unchanged.
    pub fn get_or_create(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        let (breaker, created) = self.breakers.get_or_insert_with(name, || {
            Arc::new(CircuitBreaker::new(name, config.unwrap_or_default()))
        });
        if created {
            tracing::info!(breaker = %name, "Circuit breaker registered");
        }
        breaker
    }

    /// Get a breaker by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    /// Remove a breaker. Holders of the `Arc` keep a working breaker.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.breakers.remove(name).is_some();
        if removed {
            tracing::info!(breaker = %name, "Circuit breaker removed");
        }
        removed
    }

    /// Reset every registered breaker to closed.
    pub fn reset_all(&self) {
        let breakers = self.breakers.snapshot();
        for breaker in &breakers {
            breaker.reset();
        }
        tracing::info!(count = breakers.len(), "All circuit breakers reset");
    }

    /// Stats of every breaker, keyed by name.
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers
            .snapshot()
            .iter()
            .map(|breaker| (breaker.name().to_string(), breaker.stats()))
            .collect()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.breakers.names()
    }

    /// Number of registered breakers
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Check if registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.names())
            .finish()
    }
}

/// Retry handlers by name, for operations failing with `E`.
pub struct RetryHandlerRegistry<E> {
    handlers: NamedRegistry<RetryHandler<E>>,
}

impl<E> RetryHandlerRegistry<E> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: NamedRegistry::new(),
        }
    }

    /// Register a handler built from `config`, or return the existing one
    /// with that name unchanged.
    pub fn create(&self, name: &str, config: RetryConfig) -> Arc<RetryHandler<E>> {
        self.insert_with(name, || RetryHandler::new(name, config))
    }

    /// Register a fully built handler (with `retry_if` / `stop_on`
    /// predicates), or return the existing one with that name.
    pub fn create_with(&self, name: &str, build: impl FnOnce() -> RetryHandler<E>) -> Arc<RetryHandler<E>> {
        self.insert_with(name, build)
    }

    fn insert_with(&self, name: &str, build: impl FnOnce() -> RetryHandler<E>) -> Arc<RetryHandler<E>> {
        let (handler, created) = self.handlers.get_or_insert_with(name, || Arc::new(build()));
        if created {
            tracing::info!(handler = %name, "Retry handler registered");
        } else {
            tracing::debug!(handler = %name, "Retry handler already registered, reusing");
        }
        handler
    }

    /// Get a handler by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RetryHandler<E>>> {
        self.handlers.get(name)
    }

    /// Remove a handler. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Stats of every handler, keyed by name.
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<String, RetryStats> {
        self.handlers
            .snapshot()
            .iter()
            .map(|handler| (handler.name().to_string(), handler.stats()))
            .collect()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers.names()
    }

    /// Number of registered handlers
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for RetryHandlerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for RetryHandlerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Fallback managers by name, for one argument/value/error signature.
pub struct FallbackManagerRegistry<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    managers: NamedRegistry<FallbackManager<A, T, E>>,
}

impl<A, T, E> FallbackManagerRegistry<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            managers: NamedRegistry::new(),
        }
    }

    /// Register an empty manager using `strategy`, or return the existing
    /// one with that name (whatever its strategy).
    pub fn create(&self, name: &str, strategy: FallbackStrategy) -> Arc<FallbackManager<A, T, E>> {
        let (manager, created) = self
            .managers
            .get_or_insert_with(name, || Arc::new(FallbackManager::new(name, strategy)));
        if !created && manager.strategy() != strategy {
            tracing::warn!(
                manager = %name,
                requested = %strategy,
                existing = %manager.strategy(),
                "Fallback manager already registered with another strategy"
            );
        }
        manager
    }

    /// Get a manager by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<FallbackManager<A, T, E>>> {
        self.managers.get(name)
    }

    /// Remove a manager. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.managers.remove(name).is_some()
    }

    /// Stats of every manager, keyed by name.
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<String, FallbackStats> {
        self.managers
            .snapshot()
            .iter()
            .map(|manager| (manager.name().to_string(), manager.stats()))
            .collect()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.managers.names()
    }

    /// Number of registered managers
    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    /// Check if registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A, T, E> Default for FallbackManagerRegistry<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, T, E> fmt::Debug for FallbackManagerRegistry<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackManagerRegistry")
            .field("managers", &self.names())
            .finish()
    }
}
