//! Error types for the CRR engine.

use crate::TableName;
use thiserror::Error;

/// All possible errors from the CRR engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The table fails CRR eligibility checks. The table is left unmodified.
    #[error("table '{table}' cannot become a CRR: {reason}")]
    IncompatibleSchema { table: TableName, reason: String },

    /// A change record's primary key or value cannot be decoded.
    /// The ingesting transaction fails atomically.
    #[error("malformed change record: {0}")]
    MalformedChangeRecord(String),

    /// The underlying relational engine reported an error.
    /// Always propagated, never retried internally.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    pub(crate) fn incompatible(table: impl Into<TableName>, reason: impl Into<String>) -> Self {
        Error::IncompatibleSchema {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedChangeRecord(reason.into())
    }

    pub(crate) fn storage(reason: impl Into<String>) -> Self {
        Error::StorageFailure(reason.into())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
