//! Configuration management for Ratewarden.
//!
//! Two files are involved: the service configuration, layered from an
//! optional file and `RATEWARDEN__*` environment variables, and the limits
//! file holding rules and client policies, which can be reloaded at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::ratelimit::{FailMode, LimiterOptions, PolicyEntry, PolicyTable, RuleConfig, RuleSet};

/// Prefix for environment overrides, e.g. `RATEWARDEN__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the limits file (rules and policies)
    pub limits_path: Option<String>,

    /// Watch the limits file and apply changes while running
    #[serde(default = "default_hot_reload")]
    pub hot_reload: bool,

    /// Quiet period after the last file change before reloading, in milliseconds
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,

    /// Expired counter sweep interval in seconds; defaults to the shortest rule period
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,

    /// What to do with requests no rule matches
    #[serde(default)]
    pub unmatched: FailMode,

    /// What to do when the counter store fails
    #[serde(default)]
    pub store_failure: FailMode,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limits_path: None,
            hot_reload: default_hot_reload(),
            reload_debounce_ms: default_reload_debounce_ms(),
            sweep_interval_secs: None,
            unmatched: FailMode::default(),
            store_failure: FailMode::default(),
        }
    }
}

impl RateLimitingConfig {
    /// Limiter failure modes.
    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            unmatched: self.unmatched,
            store_failure: self.store_failure,
        }
    }
}

fn default_hot_reload() -> bool {
    true
}

fn default_reload_debounce_ms() -> u64 {
    1000
}

/// Counter store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process sharded map
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for Redis counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    crate::ratelimit::redis::DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

impl RatewardenConfig {
    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading service configuration");
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// Contents of a limits file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Rate limit rules, in declaration order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Per-client allow, deny and override entries
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,

    /// Endpoint patterns that are never limited
    #[serde(default)]
    pub endpoint_whitelist: Vec<String>,
}

impl LimitsConfig {
    /// Load limits from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse limits from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Check every rule and policy without building a limiter.
    pub fn validate(&self) -> Result<()> {
        RuleSet::from_configs(&self.rules, &self.endpoint_whitelist)?;
        PolicyTable::build(self.policies.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RatewardenError;
    use crate::ratelimit::{PolicyAction, RuleScope};
    use std::io::Write;

    const LIMITS: &str = r#"
endpoint_whitelist:
  - "get:/health"
rules:
  - endpoint: "*"
    period: 1s
    limit: 2
  - endpoint: "/api/*"
    period: 1m
    limit: 5
    scope: per_client
  - endpoint: "post:/api/orders"
    period: 1h
    limit: 1000
    scope: global
policies:
  - client: 127.0.0.1
    action: allow
  - client: 198.51.100.0/24
    action: deny
"#;

    #[test]
    fn test_parse_limits() {
        let limits = LimitsConfig::from_yaml(LIMITS).unwrap();
        assert_eq!(limits.rules.len(), 3);
        assert_eq!(limits.rules[2].scope, RuleScope::Global);
        assert_eq!(limits.policies.len(), 2);
        assert_eq!(limits.policies[1].action, PolicyAction::Deny);
        assert_eq!(limits.endpoint_whitelist, vec!["get:/health".to_string()]);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_empty_limits() {
        let limits = LimitsConfig::from_yaml("{}").unwrap();
        assert_eq!(limits, LimitsConfig::default());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let limits = LimitsConfig::from_yaml(
            r#"
rules:
  - endpoint: "/api/*"
    period: 1m
    limit: 5
  - endpoint: "/API/*"
    period: 1m
    limit: 10
"#,
        )
        .unwrap();
        assert!(matches!(limits.validate(), Err(RatewardenError::Config(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            LimitsConfig::from_yaml("rules: [endpoint"),
            Err(RatewardenError::Yaml(_))
        ));
    }

    #[test]
    fn test_limits_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LIMITS.as_bytes()).unwrap();

        let limits = LimitsConfig::from_file(file.path()).unwrap();
        assert_eq!(limits.rules.len(), 3);

        assert!(matches!(
            LimitsConfig::from_file("/nonexistent/limits.yaml"),
            Err(RatewardenError::Io(_))
        ));
    }

    #[test]
    fn test_service_config_defaults() {
        let config = RatewardenConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(config.rate_limiting.hot_reload);
        assert_eq!(config.rate_limiting.reload_debounce_ms, 1000);
        assert_eq!(config.rate_limiting.unmatched, FailMode::Open);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout_ms, 50);
    }

    #[test]
    fn test_service_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(
            br#"
logging:
  level: debug
rate_limiting:
  limits_path: /etc/ratewarden/limits.yaml
  sweep_interval_secs: 30
  reload_debounce_ms: 250
  store_failure: closed
store:
  backend: redis
  redis_url: redis://cache:6379
"#,
        )
        .unwrap();

        let config = RatewardenConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.rate_limiting.limits_path.as_deref(),
            Some("/etc/ratewarden/limits.yaml")
        );
        assert_eq!(config.rate_limiting.sweep_interval_secs, Some(30));
        assert!(config.rate_limiting.hot_reload);
        assert_eq!(config.rate_limiting.reload_debounce_ms, 250);
        assert_eq!(
            config.rate_limiting.limiter_options(),
            LimiterOptions {
                unmatched: FailMode::Open,
                store_failure: FailMode::Closed,
            }
        );
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "ratewarden");
    }
}
