//! Configuration management.
//!
//! [`Config`] is the host application's configuration; [`RateLimitConfig`] is the
//! declarative record the rate limiter is built from. Both load through the
//! `config` crate from environment variables (`LIMITER__...`) and optional files.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{RateLimitError, Result};
use crate::strategy::StrategyKind;
use crate::telemetry::{LoggingConfig, MetricsConfig};

// ═══════════════════════════════════════════════════════════════════════════════
// Application Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Deployment environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
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

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment_source())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.rate_limit.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment_source())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.rate_limit.validate()?;
        Ok(cfg)
    }
}

fn environment_source() -> config::Environment {
    config::Environment::with_prefix("LIMITER")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("rate_limit.exempted_paths")
        .with_list_parse_key("rate_limit.exempted_ips")
        .with_list_parse_key("rate_limit.trusted_proxy_headers")
        .try_parsing(true)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limit Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// In-process table, single instance only
    #[default]
    Memory,
    /// Redis, safe across instances
    #[serde(alias = "redis")]
    Networked,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Networked => write!(f, "networked"),
        }
    }
}

/// Per-tenant override. Absent fields fall back to the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TenantLimits {
    #[serde(default)]
    pub rate_limit: Option<u64>,

    #[serde(default)]
    pub period_seconds: Option<u64>,

    #[serde(default)]
    pub bucket_capacity: Option<u64>,
}

/// Fully resolved limit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitParams {
    pub rate_limit: u64,
    pub period_seconds: u64,
    pub bucket_capacity: Option<u64>,
}

impl TenantLimits {
    /// Fill absent fields from `defaults`.
    pub fn merged_with(&self, defaults: &LimitParams) -> LimitParams {
        LimitParams {
            rate_limit: self.rate_limit.unwrap_or(defaults.rate_limit),
            period_seconds: self.period_seconds.unwrap_or(defaults.period_seconds),
            bucket_capacity: self.bucket_capacity.or(defaults.bucket_capacity),
        }
    }

    fn validate(&self, tenant: &str) -> Result<()> {
        let fields = [
            ("rate_limit", self.rate_limit),
            ("period_seconds", self.period_seconds),
            ("bucket_capacity", self.bucket_capacity),
        ];
        for (name, value) in fields {
            if value == Some(0) {
                return Err(RateLimitError::configuration(format!(
                    "tenant '{}': {} must be greater than 0",
                    tenant, name
                )));
            }
        }
        Ok(())
    }
}

/// Connection parameters for the networked (Redis) backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Full connection URL; takes precedence over host/port/db/password
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Total attempts per command, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,

    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay: default_retry_base_delay(),
            retry_backoff_factor: default_retry_backoff_factor(),
        }
    }
}

impl RedisSettings {
    /// Connection URL assembled from the settings.
    pub fn connection_url(&self) -> String {
        if let Some(ref url) = self.url {
            return url.clone();
        }
        match self.password {
            Some(ref password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Connection URL with any password replaced, safe for logs.
    pub fn redacted_url(&self) -> String {
        let url = self.connection_url();
        match (url.find("://"), url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}[REDACTED]{}", &url[..scheme_end + 3], &url[at..])
            }
            _ => url,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Limiting algorithm
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Counter storage
    #[serde(default)]
    pub storage: StorageType,

    /// Requests allowed per period
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,

    /// Period length in seconds
    #[serde(default = "default_period_seconds")]
    pub period_seconds: u64,

    /// Token bucket capacity (defaults to `rate_limit`)
    #[serde(default)]
    pub bucket_capacity: Option<u64>,

    /// Include the request path in the limiter key
    #[serde(default)]
    pub key_by_path: bool,

    /// Include the request method in the limiter key
    #[serde(default)]
    pub key_by_method: bool,

    /// Include the client IP in the limiter key
    #[serde(default = "default_true")]
    pub key_by_ip: bool,

    /// Emit X-RateLimit-* headers
    #[serde(default = "default_true")]
    pub include_headers: bool,

    /// Prefix for the rate limit header names
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,

    /// Paths that bypass limiting (exact, `prefix*`, or `^regex`)
    #[serde(default)]
    pub exempted_paths: Vec<String>,

    /// IPs that bypass limiting (exact or CIDR)
    #[serde(default)]
    pub exempted_ips: Vec<String>,

    /// Resolve a tenant per request and apply tenant overrides
    #[serde(default)]
    pub enable_tenant_limits: bool,

    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,

    #[serde(default = "default_tenant_param")]
    pub tenant_query_param: String,

    #[serde(default = "default_tenant_param")]
    pub tenant_path_param: String,

    /// Tenant ID -> overrides
    #[serde(default)]
    pub tenant_limits: HashMap<String, TenantLimits>,

    /// Return 500 instead of failing open when storage is unavailable
    #[serde(default)]
    pub block_on_failure: bool,

    /// Prefix scoping every storage key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Keys longer than this are shortened with a content hash
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    /// Headers consulted (in order) for the client IP
    #[serde(default = "default_trusted_proxy_headers")]
    pub trusted_proxy_headers: Vec<String>,

    /// Memory backend expiry sweep cadence
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Width of the metrics rolling window
    #[serde(default = "default_metrics_window")]
    pub metrics_window_seconds: u64,

    /// Networked storage connection parameters
    #[serde(default)]
    pub redis: RedisSettings,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: StrategyKind::default(),
            storage: StorageType::default(),
            rate_limit: default_rate_limit(),
            period_seconds: default_period_seconds(),
            bucket_capacity: None,
            key_by_path: false,
            key_by_method: false,
            key_by_ip: true,
            include_headers: true,
            header_prefix: default_header_prefix(),
            exempted_paths: Vec::new(),
            exempted_ips: Vec::new(),
            enable_tenant_limits: false,
            tenant_header: default_tenant_header(),
            tenant_query_param: default_tenant_param(),
            tenant_path_param: default_tenant_param(),
            tenant_limits: HashMap::new(),
            block_on_failure: false,
            namespace: default_namespace(),
            max_key_length: default_max_key_length(),
            trusted_proxy_headers: default_trusted_proxy_headers(),
            sweep_interval: default_sweep_interval(),
            metrics_window_seconds: default_metrics_window(),
            redis: RedisSettings::default(),
        }
    }
}

/// Shortest accepted `max_key_length`.
pub const MIN_KEY_LENGTH: usize = 16;

impl RateLimitConfig {
    /// Create a new builder for rate limit configuration.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Global default limits.
    pub fn default_limits(&self) -> LimitParams {
        LimitParams {
            rate_limit: self.rate_limit,
            period_seconds: self.period_seconds,
            bucket_capacity: self.bucket_capacity,
        }
    }

    /// Check every invariant. Fails fast with a configuration error.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit == 0 {
            return Err(RateLimitError::configuration(
                "rate_limit must be greater than 0",
            ));
        }
        if self.period_seconds == 0 {
            return Err(RateLimitError::configuration(
                "period_seconds must be greater than 0",
            ));
        }
        if self.bucket_capacity == Some(0) {
            return Err(RateLimitError::configuration(
                "bucket_capacity must be greater than 0",
            ));
        }
        if self.namespace.is_empty() {
            return Err(RateLimitError::configuration("namespace must not be empty"));
        }
        if self.max_key_length < MIN_KEY_LENGTH {
            return Err(RateLimitError::configuration(format!(
                "max_key_length must be at least {}",
                MIN_KEY_LENGTH
            )));
        }
        if self.metrics_window_seconds == 0 {
            return Err(RateLimitError::configuration(
                "metrics_window_seconds must be greater than 0",
            ));
        }
        if self.header_prefix.is_empty()
            || !self
                .header_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RateLimitError::configuration(format!(
                "header_prefix '{}' is not a valid header name prefix",
                self.header_prefix
            )));
        }
        if self.redis.retry_attempts == 0 {
            return Err(RateLimitError::configuration(
                "redis.retry_attempts must be at least 1",
            ));
        }
        for (tenant, limits) in &self.tenant_limits {
            limits.validate(tenant)?;
        }
        Ok(())
    }
}

/// Builder for rate limit configuration.
#[derive(Debug, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn rate_limit(mut self, limit: u64) -> Self {
        self.config.rate_limit = limit;
        self
    }

    pub fn period_seconds(mut self, secs: u64) -> Self {
        self.config.period_seconds = secs;
        self
    }

    pub fn bucket_capacity(mut self, capacity: u64) -> Self {
        self.config.bucket_capacity = Some(capacity);
        self
    }

    pub fn key_by(mut self, ip: bool, path: bool, method: bool) -> Self {
        self.config.key_by_ip = ip;
        self.config.key_by_path = path;
        self.config.key_by_method = method;
        self
    }

    pub fn include_headers(mut self, include: bool) -> Self {
        self.config.include_headers = include;
        self
    }

    pub fn header_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.header_prefix = prefix.into();
        self
    }

    pub fn exempt_path(mut self, path: impl Into<String>) -> Self {
        self.config.exempted_paths.push(path.into());
        self
    }

    pub fn exempt_ip(mut self, ip: impl Into<String>) -> Self {
        self.config.exempted_ips.push(ip.into());
        self
    }

    pub fn tenant_limits(mut self, tenant: impl Into<String>, limits: TenantLimits) -> Self {
        self.config.enable_tenant_limits = true;
        self.config.tenant_limits.insert(tenant.into(), limits);
        self
    }

    pub fn enable_tenant_limits(mut self, enabled: bool) -> Self {
        self.config.enable_tenant_limits = enabled;
        self
    }

    pub fn tenant_header(mut self, header: impl Into<String>) -> Self {
        self.config.tenant_header = header.into();
        self
    }

    pub fn block_on_failure(mut self, block: bool) -> Self {
        self.config.block_on_failure = block;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn max_key_length(mut self, len: usize) -> Self {
        self.config.max_key_length = len;
        self
    }

    pub fn redis(mut self, settings: RedisSettings) -> Self {
        self.config.redis = settings;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

// Default value functions
fn default_environment() -> String { "production".to_string() }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_true() -> bool { true }
fn default_rate_limit() -> u64 { 100 }
fn default_period_seconds() -> u64 { 60 }
fn default_header_prefix() -> String { "X-RateLimit".to_string() }
fn default_tenant_header() -> String { "X-Tenant-ID".to_string() }
fn default_tenant_param() -> String { "tenant_id".to_string() }
fn default_namespace() -> String { "ratelimit".to_string() }
fn default_max_key_length() -> usize { 250 }
fn default_sweep_interval() -> Duration { Duration::from_secs(60) }
fn default_metrics_window() -> u64 { 60 }
fn default_redis_host() -> String { "localhost".to_string() }
fn default_redis_port() -> u16 { 6379 }
fn default_connect_timeout() -> Duration { Duration::from_secs(5) }
fn default_command_timeout() -> Duration { Duration::from_millis(500) }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_base_delay() -> Duration { Duration::from_millis(50) }
fn default_retry_backoff_factor() -> f64 { 2.0 }

fn default_trusted_proxy_headers() -> Vec<String> {
    vec!["X-Forwarded-For".to_string(), "X-Real-IP".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = RateLimitConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy, StrategyKind::FixedWindow);
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.header_prefix, "X-RateLimit");
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let config = RateLimitConfig::builder().rate_limit(0).build();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RateLimitError::Configuration(_)));
    }

    #[test]
    fn test_zero_period_rejected() {
        let config = RateLimitConfig::builder().period_seconds(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_tenant_override_rejected() {
        let config = RateLimitConfig::builder()
            .tenant_limits(
                "acme",
                TenantLimits {
                    rate_limit: Some(0),
                    ..Default::default()
                },
            )
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_header_prefix_rejected() {
        let config = RateLimitConfig::builder().header_prefix("X Rate").build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tenant_limits_merge() {
        let defaults = LimitParams {
            rate_limit: 100,
            period_seconds: 60,
            bucket_capacity: None,
        };
        let overrides = TenantLimits {
            rate_limit: Some(10),
            period_seconds: None,
            bucket_capacity: Some(20),
        };
        let merged = overrides.merged_with(&defaults);
        assert_eq!(merged.rate_limit, 10);
        assert_eq!(merged.period_seconds, 60);
        assert_eq!(merged.bucket_capacity, Some(20));
    }

    #[test]
    fn test_redis_url_assembly_and_redaction() {
        let settings = RedisSettings {
            password: Some("hunter2".to_string()),
            db: 3,
            ..Default::default()
        };
        assert_eq!(settings.connection_url(), "redis://:hunter2@localhost:6379/3");
        assert_eq!(settings.redacted_url(), "redis://[REDACTED]@localhost:6379/3");

        let plain = RedisSettings::default();
        assert_eq!(plain.redacted_url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_deserialize_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[rate_limit]
strategy = "token_bucket"
storage = "memory"
rate_limit = 60
period_seconds = 60
bucket_capacity = 10
exempted_paths = ["/health", "/api/public/*"]
sweep_interval = "30s"

[rate_limit.tenant_limits.acme]
rate_limit = 5
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();
        let rl = &config.rate_limit;
        assert_eq!(rl.strategy, StrategyKind::TokenBucket);
        assert_eq!(rl.bucket_capacity, Some(10));
        assert_eq!(rl.exempted_paths.len(), 2);
        assert_eq!(rl.sweep_interval, Duration::from_secs(30));
        assert_eq!(rl.tenant_limits["acme"].rate_limit, Some(5));
        assert_eq!(rl.redis.command_timeout, Duration::from_millis(500));
    }
}
