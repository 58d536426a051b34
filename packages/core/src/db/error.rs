//! Row Store Error Types
//!
//! Errors raised by row store implementations. The core never masks or
//! retries these; they travel up unchanged inside `StorageError::Store`.

use std::path::PathBuf;
use thiserror::Error;

/// Row store operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to establish database connection
    #[cfg(feature = "libsql-store")]
    #[error("Failed to connect to database at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: libsql::Error,
    },

    /// Failed to initialize database schema
    #[error("Failed to initialize database schema: {0}")]
    InitializationFailed(String),

    /// Failed to create parent directory
    #[error("Failed to create parent directory for database {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// libsql operation error
    #[cfg(feature = "libsql-store")]
    #[error("Database operation failed: {0}")]
    LibsqlError(#[from] libsql::Error),

    /// SQL execution error with context
    #[error("SQL execution failed: {context}")]
    SqlExecutionError { context: String },

    /// Stored row payload could not be decoded
    #[error("Corrupt row {table}/{id}: {reason}")]
    CorruptRow {
        table: String,
        id: String,
        reason: String,
    },

    /// Transaction misuse (commit without begin, nested begin)
    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    #[cfg(feature = "libsql-store")]
    pub fn connection_failed(path: PathBuf, source: libsql::Error) -> Self {
        Self::ConnectionFailed { path, source }
    }

    pub fn initialization_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecutionError {
            context: context.into(),
        }
    }

    pub fn corrupt_row(table: &str, id: &str, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            table: table.to_string(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }
}
