//! Configuration management for the control plane
//!
//! Settings load from a TOML file or from `HANEUL_*` environment variables,
//! with defaults matching the values the subsystems document. The serde-level
//! structs here convert into the per-subsystem config types at wiring time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::collector::CollectorConfig;
use crate::dispatcher::DispatcherConfig;
use crate::routing::reconciler::CLUSTER_UPDATE_FIELDS;
use crate::routing::RoutingConfig;
use crate::utils::BackoffConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Routing reconciler configuration
    pub routing: RoutingSettings,

    /// Collector cache configuration
    pub collector: CollectorSettings,

    /// Dispatcher fan-out configuration
    pub dispatcher: DispatcherSettings,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Whether resources are tenant-scoped (multi-tenant control plane)
    pub tenant_scope: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing: RoutingSettings::default(),
            collector: CollectorSettings::default(),
            dispatcher: DispatcherSettings::default(),
            logging: LoggingConfig::default(),
            tenant_scope: false,
        }
    }
}

/// Routing reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Reconciler worker count
    pub workers: usize,

    /// Requeue attempts before an event is dropped
    pub max_retries: u32,

    /// Base delay in milliseconds for requeue backoff
    pub base_delay_ms: u64,

    /// Cap on requeue backoff in milliseconds
    pub max_delay_ms: u64,

    /// Cluster fields compared to classify an update as a real change
    pub cluster_update_fields: Vec<String>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        let defaults = BackoffConfig::default();
        Self {
            workers: 2,
            max_retries: defaults.max_retries,
            base_delay_ms: defaults.base_delay_ms,
            max_delay_ms: defaults.max_delay_ms,
            cluster_update_fields: vec!["name".to_string(), "state".to_string()],
        }
    }
}

/// Collector cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Assumed-workload expiration in seconds
    pub ttl_secs: u64,

    /// Expiry sweep cadence in milliseconds
    pub period_ms: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            period_ms: 1_000,
        }
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Bounded fan-out channel capacity
    pub queue_size: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self { queue_size: 300 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(workers) = env_parse::<usize>("HANEUL_WORKERS") {
            config.routing.workers = workers;
        }
        if let Some(max_retries) = env_parse::<u32>("HANEUL_MAX_RETRIES") {
            config.routing.max_retries = max_retries;
        }
        if let Some(base_delay_ms) = env_parse::<u64>("HANEUL_BACKOFF_BASE_MS") {
            config.routing.base_delay_ms = base_delay_ms;
        }
        if let Some(max_delay_ms) = env_parse::<u64>("HANEUL_BACKOFF_MAX_MS") {
            config.routing.max_delay_ms = max_delay_ms;
        }
        if let Ok(fields) = std::env::var("HANEUL_CLUSTER_UPDATE_FIELDS") {
            config.routing.cluster_update_fields = fields
                .split(',')
                .map(|field| field.trim().to_string())
                .filter(|field| !field.is_empty())
                .collect();
        }
        if let Some(ttl_secs) = env_parse::<u64>("HANEUL_TTL_SECS") {
            config.collector.ttl_secs = ttl_secs;
        }
        if let Some(period_ms) = env_parse::<u64>("HANEUL_PERIOD_MS") {
            config.collector.period_ms = period_ms;
        }
        if let Some(queue_size) = env_parse::<usize>("HANEUL_DISPATCHER_QUEUE_SIZE") {
            config.dispatcher.queue_size = queue_size;
        }
        if let Ok(tenant_scope) = std::env::var("HANEUL_TENANT_SCOPE") {
            config.tenant_scope = matches!(tenant_scope.as_str(), "1" | "true" | "yes");
        }
        if let Ok(level) = std::env::var("HANEUL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("HANEUL_LOG_FORMAT") {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.routing.workers == 0 {
            anyhow::bail!("routing.workers must be at least 1");
        }
        if self.dispatcher.queue_size == 0 {
            anyhow::bail!("dispatcher.queue_size must be at least 1");
        }
        if self.collector.ttl_secs == 0 {
            anyhow::bail!("collector.ttl_secs must be at least 1");
        }
        if self.collector.period_ms == 0 {
            anyhow::bail!("collector.period_ms must be at least 1");
        }
        if self.routing.cluster_update_fields.is_empty() {
            anyhow::bail!("routing.cluster_update_fields must not be empty");
        }
        for field in &self.routing.cluster_update_fields {
            if !CLUSTER_UPDATE_FIELDS.contains(&field.as_str()) {
                anyhow::bail!(
                    "unknown cluster comparison field '{field}'; known fields: {}",
                    CLUSTER_UPDATE_FIELDS.join(", ")
                );
            }
        }
        Ok(())
    }

    /// Runtime config for the routing controller
    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig {
            workers: self.routing.workers,
            backoff: BackoffConfig::with_delays(
                self.routing.max_retries,
                self.routing.base_delay_ms,
                self.routing.max_delay_ms,
            ),
            cluster_update_fields: self.routing.cluster_update_fields.clone(),
        }
    }

    /// Runtime config for the site cache
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            ttl: Duration::from_secs(self.collector.ttl_secs),
            period: Duration::from_millis(self.collector.period_ms),
        }
    }

    /// Runtime config for a dispatcher process
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_size: self.dispatcher.queue_size,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
