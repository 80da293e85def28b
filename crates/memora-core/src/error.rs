//! Unified error types for all Memora crates.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for Memora.
///
/// Backend failures (`Cache`, `Timeout`) are absorbed by the query cache and
/// never reach the caller's result. `Execution` and `Other` carry failures of
/// the caller-supplied executor and propagate unchanged.
#[derive(Error, Debug)]
pub enum MemoraError {
    // ============ Cache Backend Errors ============
    /// Redis/Cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization error (cached payloads, canonical keys)
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ============ Setup Errors ============
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    // ============ Query Errors ============
    /// The query executor failed
    #[error("Query execution failed: {0}")]
    Execution(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MemoraError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Cache(_) => "CACHE_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a cache backend error.
    #[must_use]
    pub fn cache<T: Into<String>>(message: T) -> Self {
        Self::Cache(message.into())
    }

    /// Creates an executor error.
    #[must_use]
    pub fn execution<T: Into<String>>(message: T) -> Self {
        Self::Execution(message.into())
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if this error originated in the cache backend.
    ///
    /// These errors are logged and swallowed; the query falls back to
    /// direct execution.
    #[must_use]
    pub const fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Cache(_) | Self::Timeout(_))
    }

    /// Checks if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Cache(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for MemoraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

/// Serializable error report, used by operational tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Operation that failed (e.g. `get`, `set`, `invalidate`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl ErrorReport {
    /// Creates a new report from a `MemoraError`.
    #[must_use]
    pub fn from_error(error: &MemoraError) -> Self {
        Self {
            code: error.error_code().to_string(),
            message: error.to_string(),
            operation: None,
        }
    }

    /// Sets the failing operation.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

impl From<&MemoraError> for ErrorReport {
    fn from(error: &MemoraError) -> Self {
        Self::from_error(error)
    }
}
