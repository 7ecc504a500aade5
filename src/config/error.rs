//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by configuration loading, validation and export.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file '{path}': {source}")]
    ReadError {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: '{0}'")]
    NotFound(PathBuf),

    /// TOML parse failure.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// JSON parse failure.
    #[error("failed to parse JSON configuration: {0}")]
    JsonParseError(#[from] serde_json::Error),

    /// Document parsed but failed validation.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    /// TOML serialization failure during export.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Rollback requested with no previous snapshot retained.
    #[error("no previous configuration available to roll back to")]
    NoRollback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::ValidationError("per_minute must be greater than 0".to_string());
        assert!(err.to_string().contains("validation failed"));

        let err = ConfigError::NotFound(PathBuf::from("/etc/missing.toml"));
        assert!(err.to_string().contains("/etc/missing.toml"));

        let err = ConfigError::NoRollback;
        assert!(err.to_string().contains("roll back"));
    }
}
