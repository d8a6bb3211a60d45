//! Configuration for the resilience layer.
//!
//! Settings are plain serde structs, loaded from TOML or built from
//! per-environment defaults, validated, then converted into the
//! `Duration`-typed runtime configs ([`CircuitBreakerConfig`],
//! [`RetryConfig`]).
//!
//! # Environment variables
//!
//! - `C0R_RELIABILITY_ENV`: `development` (default), `staging` or `production`
//! - `C0R_RELIABILITY_CONFIG`: optional path to a TOML settings file
//!
//! # Example
//!
//! ```rust
//! use c0r_reliability::config::ReliabilitySettings;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ReliabilitySettings::from_toml_str(
//!     r#"
//!     environment = "production"
//!
//!     [breakers.openai-vision]
//!     failure_threshold = 3
//!     recovery_timeout_ms = 30000
//!
//!     [retries.openai-vision]
//!     max_attempts = 4
//!     strategy = "fibonacci"
//!     "#,
//! )?;
//!
//! let breaker = settings.breaker_config("openai-vision");
//! assert_eq!(breaker.failure_threshold, 3);
//! assert_eq!(breaker.recovery_timeout, Duration::from_secs(30));
//!
//! // Unnamed components get the defaults
//! assert_eq!(settings.retry_config("database").max_attempts, 3);
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::{DEFAULT_HISTORY_SIZE, DEFAULT_RETRY_PAUSE};
use crate::retry::{RetryConfig, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable selecting the deployment environment.
pub const ENV_VAR: &str = "C0R_RELIABILITY_ENV";

/// Environment variable pointing at a TOML settings file.
pub const CONFIG_PATH_VAR: &str = "C0R_RELIABILITY_CONFIG";

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid environment value
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    /// Failed to read a configuration file
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        /// File that could not be read
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development environment (local)
    #[default]
    Development,
    /// Staging environment (pre-production)
    Staging,
    /// Production environment
    Production,
}

impl Environment {
    /// Check if this is production environment
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is development environment
    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidEnvironment(s.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log level (trace, debug, info, warn, error), case-insensitive
    pub log_level: String,
    /// Install the Prometheus recorder
    pub metrics_enabled: bool,
}

impl ObservabilitySettings {
    /// Validate observability settings
    ///
    /// # Errors
    ///
    /// Returns error if the log level is unknown
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "invalid log_level: {}. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

/// Circuit breaker settings for one named breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call, in milliseconds
    pub recovery_timeout_ms: u64,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Per-call timeout, in milliseconds
    pub call_timeout_ms: u64,
}

impl BreakerSettings {
    /// Validate breaker settings
    ///
    /// # Errors
    ///
    /// Returns error if a threshold or duration is zero
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid(format!("breaker '{name}': failure_threshold must be > 0")));
        }
        if self.success_threshold == 0 {
            return Err(invalid(format!("breaker '{name}': success_threshold must be > 0")));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(invalid(format!("breaker '{name}': recovery_timeout_ms must be > 0")));
        }
        if self.call_timeout_ms == 0 {
            return Err(invalid(format!("breaker '{name}': call_timeout_ms must be > 0")));
        }
        Ok(())
    }

    /// Convert into a runtime config
    #[must_use]
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .recovery_timeout(Duration::from_millis(self.recovery_timeout_ms))
            .success_threshold(self.success_threshold)
            .timeout(Duration::from_millis(self.call_timeout_ms))
            .build()
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout_ms: millis(defaults.recovery_timeout),
            success_threshold: defaults.success_threshold,
            call_timeout_ms: millis(defaults.timeout),
        }
    }
}

/// Retry settings for one named handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Base delay, in milliseconds
    pub base_delay_ms: u64,
    /// Delay cap, in milliseconds
    pub max_delay_ms: u64,
    /// Delay growth strategy
    pub strategy: RetryStrategy,
    /// Growth factor for the exponential strategy
    pub backoff_multiplier: f64,
    /// Apply jitter to computed delays
    pub jitter: bool,
    /// Jitter amplitude as a fraction of the delay
    pub jitter_range: f64,
    /// Per-attempt timeout, in milliseconds
    pub timeout_per_attempt_ms: Option<u64>,
}

impl RetrySettings {
    /// Validate retry settings
    ///
    /// # Errors
    ///
    /// Returns error if attempts are zero, delays are inverted or the
    /// multiplier or jitter range are out of bounds
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid(format!("retry '{name}': max_attempts must be > 0")));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(format!(
                "retry '{name}': base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid(format!("retry '{name}': backoff_multiplier must be >= 1.0")));
        }
        if !(0.0..=1.0).contains(&self.jitter_range) {
            return Err(invalid(format!(
                "retry '{name}': jitter_range must be between 0.0 and 1.0"
            )));
        }
        if self.timeout_per_attempt_ms == Some(0) {
            return Err(invalid(format!("retry '{name}': timeout_per_attempt_ms must be > 0")));
        }
        Ok(())
    }

    /// Convert into a runtime config
    #[must_use]
    pub fn to_config(&self) -> RetryConfig {
        let builder = RetryConfig::builder()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .strategy(self.strategy)
            .backoff_multiplier(self.backoff_multiplier)
            .jitter(self.jitter)
            .jitter_range(self.jitter_range);
        match self.timeout_per_attempt_ms {
            Some(ms) => builder.timeout_per_attempt(Duration::from_millis(ms)).build(),
            None => builder.build(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: millis(defaults.base_delay),
            max_delay_ms: millis(defaults.max_delay),
            strategy: defaults.strategy,
            backoff_multiplier: defaults.backoff_multiplier,
            jitter: defaults.jitter,
            jitter_range: defaults.jitter_range,
            timeout_per_attempt_ms: defaults.timeout_per_attempt.map(millis),
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Monitoring loop tick, in milliseconds
    pub tick_ms: u64,
    /// Results kept per check
    pub history_size: usize,
    /// Pause between attempts of a failing probe, in milliseconds
    pub retry_pause_ms: u64,
}

impl HealthSettings {
    /// Validate health settings
    ///
    /// # Errors
    ///
    /// Returns error if the tick or history size is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(invalid("health: tick_ms must be > 0"));
        }
        if self.history_size == 0 {
            return Err(invalid("health: history_size must be > 0"));
        }
        Ok(())
    }

    /// Monitoring loop tick
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Pause between probe attempts
    #[must_use]
    pub const fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            tick_ms: 10_000,
            history_size: DEFAULT_HISTORY_SIZE,
            retry_pause_ms: millis(DEFAULT_RETRY_PAUSE),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// All settings of the resilience layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilitySettings {
    /// Deployment environment
    pub environment: Environment,
    /// Logging and metrics
    pub observability: ObservabilitySettings,
    /// Settings for breakers without a named entry
    pub breaker_defaults: BreakerSettings,
    /// Settings for retry handlers without a named entry
    pub retry_defaults: RetrySettings,
    /// Named breakers
    pub breakers: BTreeMap<String, BreakerSettings>,
    /// Named retry handlers
    pub retries: BTreeMap<String, RetrySettings>,
    /// Health monitoring
    pub health: HealthSettings,
}

impl ReliabilitySettings {
    /// Load settings from the process environment
    ///
    /// Reads `C0R_RELIABILITY_ENV` (defaults to development). When
    /// `C0R_RELIABILITY_CONFIG` names a file, that file is loaded and the
    /// environment variable (if set) overrides its `environment`; otherwise
    /// the per-environment defaults are used.
    ///
    /// # Errors
    ///
    /// Returns error if the environment name is invalid, the file cannot be
    /// read or parsed, or the result fails validation
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let environment = lookup(ENV_VAR).map(|env| env.parse::<Environment>()).transpose()?;

        match lookup(CONFIG_PATH_VAR) {
            Some(path) => {
                let mut settings = Self::from_file(&path)?;
                if let Some(environment) = environment {
                    settings.environment = environment;
                }
                tracing::info!(path = %path, environment = %settings.environment, "Reliability settings loaded from file");
                Ok(settings)
            }
            None => Self::load(environment.unwrap_or_default()),
        }
    }

    /// Defaults for `environment`
    ///
    /// # Errors
    ///
    /// Returns error if the resulting settings are invalid
    pub fn load(environment: Environment) -> Result<Self, ConfigError> {
        let mut settings = Self {
            environment,
            ..Self::default()
        };

        // Environment-specific overrides
        match environment {
            Environment::Development => {
                settings.observability.log_level = "debug".to_string();
                settings.health.tick_ms = 5_000;
            }
            Environment::Staging => {
                settings.observability.log_level = "info".to_string();
            }
            Environment::Production => {
                settings.observability.log_level = "warn".to_string();
                settings.breaker_defaults.failure_threshold = 3; // Stricter in prod
                settings.health.tick_ms = 30_000;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate TOML settings
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed or the settings are invalid
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read, parse and validate a TOML settings file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is malformed or is invalid
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Validate all settings
    ///
    /// # Errors
    ///
    /// Returns the first invalid section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.observability.validate()?;
        self.breaker_defaults.validate("defaults")?;
        self.retry_defaults.validate("defaults")?;
        for (name, breaker) in &self.breakers {
            breaker.validate(name)?;
        }
        for (name, retry) in &self.retries {
            retry.validate(name)?;
        }
        self.health.validate()?;
        Ok(())
    }

    /// Runtime config for the breaker `name`, or the defaults
    #[must_use]
    pub fn breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        self.breakers
            .get(name)
            .unwrap_or(&self.breaker_defaults)
            .to_config()
    }

    /// Runtime config for the retry handler `name`, or the defaults
    #[must_use]
    pub fn retry_config(&self, name: &str) -> RetryConfig {
        self.retries
            .get(name)
            .unwrap_or(&self.retry_defaults)
            .to_config()
    }

    /// Check if running in production
    #[must_use]
    pub const fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}
