//! Error types for baylock-core operations.

use std::path::PathBuf;

/// All errors that can occur in baylock-core operations.
#[derive(Debug, thiserror::Error)]
pub enum KioskError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file not found at {0}")]
    ConfigMissing(PathBuf),

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration invalid: {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // Schedule Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid time label: {0:?}")]
    InvalidTimeLabel(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using KioskError.
pub type Result<T> = std::result::Result<T, KioskError>;

impl From<KioskError> for String {
    fn from(err: KioskError) -> String {
        err.to_string()
    }
}
