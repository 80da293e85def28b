//! Application configuration structures.

use memora_core::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Query cache policy.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Redis configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "memora".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Which cache backend the query cache talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Redis through a deadpool connection pool.
    #[default]
    Redis,
    /// Process-local map, for development and tests.
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis => write!(f, "redis"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Query cache policy.
///
/// The complexity bounds and the execution-time threshold decide whether a
/// query result is worth storing at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global runtime switch. When false every query executes directly.
    pub enabled: bool,
    /// Prefix for every generated cache key.
    pub namespace: String,
    /// TTL applied when a query does not override it.
    pub default_ttl_secs: u64,
    /// Queries scoring below this are cheaper to run than to cache.
    pub min_complexity: f64,
    /// Queries scoring above this are too specific to be reused.
    pub max_complexity: f64,
    /// Results computed faster than this are never stored.
    pub min_execution_time_ms: u64,
    /// Interval between statistics gauge pushes.
    pub stats_push_interval_secs: u64,
    /// Number of entries reported in the "most accessed" list.
    pub top_entries: usize,
    /// Backend selection.
    pub backend: BackendKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "memora:query".to_string(),
            default_ttl_secs: 300, // 5 minutes
            min_complexity: 10.0,
            max_complexity: 200.0,
            min_execution_time_ms: 50,
            stats_push_interval_secs: 30,
            top_entries: 10,
            backend: BackendKind::Redis,
        }
    }
}

impl CacheConfig {
    /// Returns the default TTL as a Duration.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Returns the population threshold as a Duration.
    #[must_use]
    pub const fn min_execution_time(&self) -> Duration {
        Duration::from_millis(self.min_execution_time_ms)
    }

    /// Returns the statistics push interval as a Duration.
    #[must_use]
    pub const fn stats_push_interval(&self) -> Duration {
        Duration::from_secs(self.stats_push_interval_secs)
    }

    /// Configuration with caching switched off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL.
    pub url: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Enable Redis (can be disabled for local development).
    pub enabled: bool,
    /// Prefix for the tag index sets.
    pub tag_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            enabled: true,
            tag_prefix: "memora:tag:".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format (json, pretty).
    pub log_format: String,
    /// Enable metrics.
    pub metrics_enabled: bool,
    /// Enable OpenTelemetry export.
    pub tracing_enabled: bool,
    /// OTLP collector endpoint.
    pub otlp_endpoint: Option<String>,
    /// Trace sampling ratio (0.0 to 1.0).
    pub sampling_ratio: f64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            tracing_enabled: false,
            otlp_endpoint: None,
            sampling_ratio: 1.0,
        }
    }
}

impl ObservabilityConfig {
    /// Builds the telemetry bootstrap settings.
    #[must_use]
    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            enabled: self.tracing_enabled,
            service_name: service_name.to_string(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            sampling_ratio: self.sampling_ratio,
            console_output: true,
            json_format: self.log_format.eq_ignore_ascii_case("json"),
        }
    }
}
