//! Error types for `issue_timeline`.
//!
//! Library code returns [`Result`] and propagates with `?`. The batch
//! orchestrator is the only place that swallows errors: it logs them with
//! issue context and moves on to the next issue.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TimelineError>;

/// Errors raised while normalizing, reconstructing or classifying.
#[derive(Debug, Error)]
pub enum TimelineError {
    /// Storage engine failure (lookup, insert, update, delete).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A raw history record that cannot be turned into change events.
    #[error("malformed history record: {reason}")]
    MalformedRecord { reason: String },

    #[error("unknown field type: {0}")]
    InvalidFieldType(String),

    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },
}

impl TimelineError {
    /// Shorthand for a [`TimelineError::MalformedRecord`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`TimelineError::Validation`].
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True when the error is caused by bad input rather than the store.
    #[must_use]
    pub const fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedRecord { .. } | Self::InvalidFieldType(_) | Self::Json(_)
        )
    }
}
