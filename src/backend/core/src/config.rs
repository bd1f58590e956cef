//! Configuration management.
//!
//! Values come from an optional file plus `KEEL__*` environment variables,
//! e.g. `KEEL__DISPATCHER__BATCH_SIZE=64` or `KEEL__BREAKERS__DEFAULTS__RESET=45s`.

use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Claim worker configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breakers: BreakersConfig,

    /// Degraded-mode configuration
    #[serde(default)]
    pub degraded: DegradedConfig,

    /// Header governor configuration
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Per-turn admission budgets
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Saga recorder configuration
    #[serde(default)]
    pub saga: SagaConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. When absent the in-memory store is used.
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// Whether the server runs a claim worker in-process
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between ticks while work is available
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Upper bound for the idle backoff after empty ticks
    #[serde(default = "default_idle_backoff_max", with = "humantime_serde")]
    pub idle_backoff_max: Duration,

    /// Maximum events claimed per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Lease duration for claimed events
    #[serde(default = "default_visibility_timeout", with = "humantime_serde")]
    pub visibility_timeout: Duration,

    /// Per-call downstream timeout
    #[serde(default = "default_handler_timeout", with = "humantime_serde")]
    pub handler_timeout: Duration,

    /// Identifier recorded on claims. Generated when unset.
    pub worker_id: Option<String>,

    /// Retry / dead-letter policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: default_tick_interval(),
            idle_backoff_max: default_idle_backoff_max(),
            batch_size: default_batch_size(),
            visibility_timeout: default_visibility_timeout(),
            handler_timeout: default_handler_timeout(),
            worker_id: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
    ExponentialWithJitter,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts before an event is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_kind")]
    pub strategy: BackoffKind,

    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            strategy: default_backoff_kind(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_fails")]
    pub fails: u32,

    /// Time spent open before a probe is allowed
    #[serde(default = "default_reset", with = "humantime_serde")]
    pub reset: Duration,

    /// Fraction of half-open calls admitted as probes
    #[serde(default = "default_half_open_prob")]
    pub half_open_prob: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            fails: default_fails(),
            reset: default_reset(),
            half_open_prob: default_half_open_prob(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakersConfig {
    /// Settings applied to every dependency without an override
    #[serde(default)]
    pub defaults: BreakerSettings,

    /// Monitored dependencies; each gets a breaker at startup
    #[serde(default = "default_dependencies")]
    pub dependencies: Vec<String>,

    /// Per-dependency overrides
    #[serde(default)]
    pub overrides: HashMap<String, BreakerSettings>,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            defaults: BreakerSettings::default(),
            dependencies: default_dependencies(),
            overrides: HashMap::new(),
        }
    }
}

impl BreakersConfig {
    /// Effective settings for a dependency.
    pub fn settings_for(&self, dependency: &str) -> BreakerSettings {
        self.overrides
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DegradedConfig {
    /// Consecutive successes (K) required to clear degraded mode
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
}

impl Default for DegradedConfig {
    fn default() -> Self {
        Self {
            recovery_successes: default_recovery_successes(),
        }
    }
}

/// How the governor treats missing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorMode {
    /// Reject requests missing either header
    #[default]
    Strict,
    /// Synthesize missing values and continue
    Soft,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GovernorConfig {
    #[serde(default)]
    pub mode: GovernorMode,

    #[serde(default = "default_correlation_header")]
    pub correlation_header: String,

    #[serde(default = "default_idempotency_header")]
    pub idempotency_header: String,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            mode: GovernorMode::default(),
            correlation_header: default_correlation_header(),
            idempotency_header: default_idempotency_header(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default = "default_tokens_limit")]
    pub tokens_limit: u64,

    #[serde(default = "default_tool_calls_limit")]
    pub tool_calls_limit: u32,

    /// Value returned to rejected callers as `retry_after_sec`
    #[serde(default = "default_retry_after_sec")]
    pub retry_after_sec: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            tokens_limit: default_tokens_limit(),
            tool_calls_limit: default_tool_calls_limit(),
            retry_after_sec: default_retry_after_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SagaConfig {
    /// Retained saga records before the oldest closed ones are evicted
    #[serde(default = "default_max_sagas")]
    pub max_sagas: usize,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_sagas: default_max_sagas(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_tick_interval() -> Duration { Duration::from_millis(500) }
fn default_idle_backoff_max() -> Duration { Duration::from_secs(5) }
fn default_batch_size() -> usize { 32 }
fn default_visibility_timeout() -> Duration { Duration::from_secs(30) }
fn default_handler_timeout() -> Duration { Duration::from_secs(10) }
fn default_max_retries() -> u32 { 5 }
fn default_backoff_kind() -> BackoffKind { BackoffKind::ExponentialWithJitter }
fn default_initial_delay() -> Duration { Duration::from_secs(1) }
fn default_max_delay() -> Duration { Duration::from_secs(300) }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter_factor() -> f64 { 0.2 }
fn default_fails() -> u32 { 5 }
fn default_reset() -> Duration { Duration::from_secs(30) }
fn default_half_open_prob() -> f64 { 1.0 }
fn default_dependencies() -> Vec<String> {
    vec!["vector_store".to_string(), "belief_processor".to_string()]
}
fn default_recovery_successes() -> u32 { 5 }
fn default_correlation_header() -> String { "X-Correlation-ID".to_string() }
fn default_idempotency_header() -> String { "Idempotency-Key".to_string() }
fn default_tokens_limit() -> u64 { 20000 }
fn default_tool_calls_limit() -> u32 { 16 }
fn default_retry_after_sec() -> u64 { 1 }
fn default_max_sagas() -> usize { 10_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("KEEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("KEEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let mut breakers: Vec<(&str, &BreakerSettings)> = vec![("default", &self.breakers.defaults)];
        breakers.extend(self.breakers.overrides.iter().map(|(k, v)| (k.as_str(), v)));

        for (name, settings) in breakers {
            if settings.fails < 1 {
                return Err(KeelError::configuration(format!(
                    "breakers.{}: fails must be at least 1",
                    name
                )));
            }
            if !(settings.half_open_prob > 0.0 && settings.half_open_prob <= 1.0) {
                return Err(KeelError::configuration(format!(
                    "breakers.{}: half_open_prob must be in (0, 1]",
                    name
                )));
            }
        }

        let dispatcher = &self.dispatcher;
        if dispatcher.batch_size < 1 {
            return Err(KeelError::configuration("dispatcher.batch_size must be at least 1"));
        }
        if dispatcher.retry.max_retries < 1 {
            return Err(KeelError::configuration("dispatcher.retry.max_retries must be at least 1"));
        }
        if dispatcher.visibility_timeout <= dispatcher.handler_timeout {
            return Err(KeelError::configuration(
                "dispatcher.visibility_timeout must exceed dispatcher.handler_timeout",
            ));
        }
        if self.degraded.recovery_successes < 1 {
            return Err(KeelError::configuration("degraded.recovery_successes must be at least 1"));
        }

        Ok(())
    }
}
