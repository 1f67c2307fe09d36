//! Error types for the Ratewarden limiter.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Ratewarden operations.
///
/// Only configuration problems reach callers of the limiter. Per-request
/// outcomes, including rejections and counter store failures, are values.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors (malformed rule, duplicate rule, bad CIDR)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced by administrative operations
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Limits file watcher errors
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
