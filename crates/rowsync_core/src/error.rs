//! Error types for the core crate.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by schema lookups, validation, permission checks and
/// mutation execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// The operation requires an identity and none was supplied.
    #[error("not authenticated")]
    NotAuthenticated,

    /// An identity is present but the table's policy rejects the operation.
    #[error("permission denied: {action} on {table}")]
    PermissionDenied {
        /// Table name.
        table: String,
        /// Attempted action (select, insert, update, delete).
        action: String,
    },

    /// Malformed payload or row.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The authoritative row moved past the version the mutation expected.
    #[error("conflict on {table} {key}: expected version {expected}, found {actual}")]
    Conflict {
        /// Table name.
        table: String,
        /// Display form of the row key.
        key: String,
        /// Version the client based its mutation on.
        expected: u64,
        /// Current authoritative version (0 when the row is gone).
        actual: u64,
    },

    /// Reference to a table that was never declared.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Reference to a column that the table does not declare.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Reference to a relationship that was never declared.
    #[error("unknown relationship {name} on table {table}")]
    UnknownRelationship {
        /// Source table name.
        table: String,
        /// Relationship name.
        name: String,
    },

    /// No custom mutator registered under this name.
    #[error("unknown mutator: {0}")]
    UnknownMutator(String),

    /// Invalid schema or permission declaration (fatal at startup).
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a permission denied error.
    pub fn denied(table: impl Into<String>, action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            table: table.into(),
            action: action.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema(message.into())
    }

    /// Returns true for errors caused by a startup declaration mistake.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CoreError::UnknownTable(_)
                | CoreError::UnknownColumn { .. }
                | CoreError::UnknownRelationship { .. }
                | CoreError::InvalidSchema(_)
        )
    }
}
