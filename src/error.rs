use std::time::Duration;

use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(format!("Database error: {}", err))
    }
}

impl From<::config::ConfigError> for LedgerError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed append payload. Raised before any hashing or persistence.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another writer kept winning the race for the scope's tail.
    #[error("Conflict appending to scope {scope}: tail moved on {attempts} attempts")]
    Conflict { scope: String, attempts: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data cannot be interpreted safely (e.g. unknown encoding version).
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out after {0:?} waiting for the scope's write slot")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Storage(_) | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
