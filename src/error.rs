//! Error types for musqly.
//!
//! All fallible operations return [`Error`] through the [`Result`] alias.
//! Statement failures carry the MySQL error number so callers can branch on
//! server-side conditions without matching message text.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed after {attempts} attempts: {message}")]
    Connection { message: String, attempts: u32 },

    #[error("Statement failed ({code}): {message}")]
    Execution {
        /// MySQL error number, e.g. 1062 for a duplicate key.
        code: u32,
        message: String,
        sql: String,
    },

    #[error("Column not found in result rows: {column}")]
    ColumnNotFound { column: String },

    #[error("Key allocation for table '{table}' gave up after {attempts} attempts")]
    KeyAllocation { table: String, attempts: u32 },

    #[error("No inserted key available: {detail}")]
    MissingKey { detail: String },
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error recording how many attempts were made.
    pub fn connection(message: impl Into<String>, attempts: u32) -> Self {
        Self::Connection {
            message: message.into(),
            attempts,
        }
    }

    /// Create an execution error for a failed statement.
    pub fn execution(code: u32, message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Execution {
            code,
            message: message.into(),
            sql: sql.into(),
        }
    }

    /// Create a column-not-found error (strict column extraction).
    pub fn column_not_found(column: impl Into<String>) -> Self {
        Self::ColumnNotFound {
            column: column.into(),
        }
    }

    /// Create a key-allocation error after the probe cap was hit.
    pub fn key_allocation(table: impl Into<String>, attempts: u32) -> Self {
        Self::KeyAllocation {
            table: table.into(),
            attempts,
        }
    }

    /// Create a missing-key error for strict inserted-key reads.
    pub fn missing_key(detail: impl Into<String>) -> Self {
        Self::MissingKey {
            detail: detail.into(),
        }
    }

    /// The MySQL error number, for statement failures.
    pub fn mysql_code(&self) -> Option<u32> {
        match self {
            Self::Execution { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The statement text that failed, for statement failures.
    pub fn failed_sql(&self) -> Option<&str> {
        match self {
            Self::Execution { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Check if this error is worth retrying at the application level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Result type alias for all crate operations.
pub type Result<T> = std::result::Result<T, Error>;
