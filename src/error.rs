//! Custom error types for the application.
//!
//! This module defines the primary error type, `StreamError`, shared by the stager and the
//! streamer. Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the failures that can occur while staging data, building the catalog and
//! publishing batches.
//!
//! ## Error Hierarchy
//!
//! Errors fall into two broad categories:
//!
//! 1. **Setup errors** - `Config`, `Configuration`, `Staging`, `FetchTimeout`,
//!    `ReadinessTimeout`, `CatalogEmpty`, `FeatureNotEnabled`
//!    - Occur once, before the steady-state loop starts
//!    - Stop the process that hit them
//!
//! 2. **Per-tick errors** - `FileOpen`, `Reader`, `Sink`, `FilenameParse`
//!    - Occur while scanning or streaming
//!    - Are logged and retried (or the offending file skipped); they never stop the loop
//!
//! By using `#[from]`, `StreamError` can be created from the underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, StreamError>;

/// Primary error type for staging and streaming.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying filesystem or process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shared storage could not be populated.
    #[error("Staging failed: {0}")]
    Staging(String),

    /// The corpus fetch did not complete in time.
    #[error("Fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    /// The readiness marker did not appear in time.
    #[error("Shared storage not ready after {0:?}")]
    ReadinessTimeout(Duration),

    /// No file survived discovery and filtering.
    #[error("Catalog is empty: no eligible files in shared storage")]
    CatalogEmpty,

    /// A file name does not follow the expected schema.
    #[error("Cannot parse file name '{filename}': {reason}")]
    FilenameParse {
        /// Offending file name.
        filename: String,
        /// What was missing or malformed.
        reason: String,
    },

    /// A dataset file could not be opened.
    #[error("Failed to open '{}': {reason}", path.display())]
    FileOpen {
        /// Path that failed to open.
        path: PathBuf,
        /// Reader-specific cause.
        reason: String,
    },

    /// Reading rows from an open dataset failed.
    #[error("Dataset read error: {0}")]
    Reader(String),

    /// The telemetry sink rejected a write.
    #[error("Telemetry sink error: {0}")]
    Sink(String),

    /// Functionality compiled out via feature flags.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The operation was interrupted by a shutdown request.
    #[error("Shutdown requested")]
    Shutdown,
}

impl From<figment::Error> for StreamError {
    fn from(value: figment::Error) -> Self {
        StreamError::Config(Box::new(value))
    }
}

impl StreamError {
    /// Whether this error should stop the process rather than the current tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            StreamError::Config(_)
            | StreamError::Configuration(_)
            | StreamError::Staging(_)
            | StreamError::FetchTimeout(_)
            | StreamError::ReadinessTimeout(_)
            | StreamError::CatalogEmpty
            | StreamError::FeatureNotEnabled(_)
            | StreamError::Shutdown => true,
            StreamError::Io(_)
            | StreamError::FilenameParse { .. }
            | StreamError::FileOpen { .. }
            | StreamError::Reader(_)
            | StreamError::Sink(_) => false,
        }
    }
}
