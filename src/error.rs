//! Engine-level error type.
//!
//! Admission decisions are values, never errors; this type covers the
//! administrative surface (configuration changes, backend management).

use crate::backend::BackendError;
use crate::config::ConfigError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by administrative engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration loading, validation or export failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A counter backend operation failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
