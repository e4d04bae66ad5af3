//! Unified error handling for ccl-metrics
//!
//! This module provides a single error type for every stage of a metric
//! pipeline. Errors are grouped into categories that decide how far they
//! travel:
//! - Configuration errors (missing or unreadable workload card, bad flags)
//!   abort the invocation
//! - Data errors (missing trace file, missing table, malformed trace) are
//!   contained to the metric that hit them
//! - Output errors (CSV persistence) never invalidate a computed result
//! - Internal errors indicate a bug or an unexpected I/O failure

use std::fmt;
use std::path::{Path, PathBuf};

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for ccl-metrics
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    // ========== Configuration Errors ==========
    /// Workload card is absent or unreadable
    #[error("Workload card not readable at {}: {reason}", .path.display())]
    MissingWorkloadCard { path: PathBuf, reason: String },

    /// Workload card exists but does not have the expected shape
    #[error("Invalid workload card {}: {reason}", .path.display())]
    InvalidWorkloadCard { path: PathBuf, reason: String },

    /// Invalid pipeline configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Metric name not recognized
    #[error("Unsupported metric name: {0}")]
    UnknownMetric(String),

    // ========== Data Errors ==========
    /// Backing trace file or directory is absent
    #[error("Trace source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Expected profiler table is missing from the store
    #[error("Table {table} not found in {}", .path.display())]
    MissingTable { table: String, path: PathBuf },

    /// Trace file could be read but not understood
    #[error("Malformed trace {}: {reason}", .path.display())]
    MalformedTrace { path: PathBuf, reason: String },

    /// SQLite query failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========== Output Errors ==========
    /// Sample table could not be written
    #[error("CSV output error: {0}")]
    Csv(#[from] csv::Error),

    // ========== Internal Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MetricError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            MetricError::MissingWorkloadCard { .. }
            | MetricError::InvalidWorkloadCard { .. }
            | MetricError::InvalidConfiguration(_)
            | MetricError::UnknownMetric(_) => ErrorCategory::Configuration,

            MetricError::SourceNotFound(_)
            | MetricError::MissingTable { .. }
            | MetricError::MalformedTrace { .. }
            | MetricError::Sqlite(_)
            | MetricError::Json(_) => ErrorCategory::Data,

            MetricError::Csv(_) => ErrorCategory::Output,

            MetricError::Io(_) | MetricError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Configuration errors abort the whole invocation
    pub fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Data errors are contained to the metric that produced them
    pub fn is_data_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Data)
    }

    /// Build a `MalformedTrace` for `path`
    pub fn malformed(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        MetricError::MalformedTrace {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Error category for handling decisions
///
/// - Configuration: abort, exit non-zero
/// - Data: log, report the metric as not applicable
/// - Output: log, keep the computed result
/// - Internal: propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad CLI input or workload metadata
    Configuration,
    /// Trace content missing or unreadable
    Data,
    /// Derived output could not be written
    Output,
    /// Bug or unexpected system failure
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Data => write!(f, "Data"),
            ErrorCategory::Output => write!(f, "Output"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Helper type alias for Results using MetricError
pub type MetricResult<T> = std::result::Result<T, MetricError>;

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("stream for device {} vanished", device));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::MetricError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MetricError::Internal(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with the path that produced it
///
/// # Examples
/// ```ignore
/// let text = std::fs::read_to_string(&p).map_err(|e| io_context(e, &p))?;
/// ```
pub fn io_context(err: std::io::Error, path: &Path) -> MetricError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return MetricError::SourceNotFound(path.to_path_buf());
    }
    MetricError::Io(std::io::Error::new(
        err.kind(),
        format!("{}: {}", path.display(), err),
    ))
}
