//! Statement and driver error types.

use thiserror::Error;

/// Errors produced by statement construction and driver execution.
#[derive(Debug, Error)]
pub enum Error {
    /// Referenced table does not exist.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Referenced column does not exist in any visible table.
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// A unique index or primary key would be violated.
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Transaction could not be committed or was used after completion.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Statement shape the driver cannot execute.
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    /// Malformed statement.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, Error>;
