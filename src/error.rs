//! Engine error types

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed request parameters, rejected before any I/O
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// A single upstream call failed (transient, eligible for retry)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream still failing after all retry attempts
    #[error("Upstream unavailable after {attempts} attempt(s): {message}")]
    UpstreamUnavailable { attempts: u32, message: String },

    /// A batch transaction failed and was rolled back
    #[error("Store write failed for {series} ({rows} rows): {source}")]
    StoreWrite {
        series: String,
        rows: usize,
        #[source]
        source: rusqlite::Error,
    },

    /// The chunk planner could not advance its anchor
    #[error("Planning stalled for {series} at {anchor}: {reason}")]
    PlanningStalled {
        series: String,
        anchor: DateTime<Utc>,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Writer closed: {0}")]
    WriterClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Stable error code used by the HTTP surface
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidRange(_) => "INVALID_RANGE",
            SyncError::Upstream(_) => "UPSTREAM_ERROR",
            SyncError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            SyncError::StoreWrite { .. } => "STORE_WRITE_ERROR",
            SyncError::PlanningStalled { .. } => "PLANNING_STALLED",
            SyncError::Database(_) => "DATABASE_ERROR",
            SyncError::Pool(_) => "POOL_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Validation(_) => "VALIDATION_ERROR",
            SyncError::Config(_) => "CONFIG_ERROR",
            SyncError::WriterClosed(_) => "WRITER_CLOSED",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the upstream retry loop may try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Upstream(_))
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Internal(format!("background task failed: {}", err))
    }
}

/// Serializable error response for API clients
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&SyncError> for ErrorResponse {
    fn from(err: &SyncError) -> Self {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for ErrorResponse {
    fn from(err: SyncError) -> Self {
        ErrorResponse::from(&err)
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        ErrorResponse::from(self).serialize(serializer)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
