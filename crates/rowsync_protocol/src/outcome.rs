//! Per-mutation results reported by the server.

use rowsync_core::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error categories a mutation can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An identity was required and none was present.
    NotAuthenticated,
    /// The identity may not perform the operation.
    PermissionDenied,
    /// The payload was malformed.
    Validation,
    /// The row moved past the version the client based its change on.
    Conflict,
    /// No mutator registered under the given name.
    UnknownMutator,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::NotAuthenticated => "not authenticated",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UnknownMutator => "unknown mutator",
            ErrorKind::Internal => "internal",
        })
    }
}

/// A categorized mutation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationError {
    /// Category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl MutationError {
    /// Creates an error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for MutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for MutationError {}

impl From<&CoreError> for MutationError {
    fn from(err: &CoreError) -> Self {
        let kind = match err {
            CoreError::NotAuthenticated => ErrorKind::NotAuthenticated,
            CoreError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            CoreError::Validation(_)
            | CoreError::UnknownTable(_)
            | CoreError::UnknownColumn { .. }
            | CoreError::UnknownRelationship { .. } => ErrorKind::Validation,
            CoreError::Conflict { .. } => ErrorKind::Conflict,
            CoreError::UnknownMutator(_) => ErrorKind::UnknownMutator,
            CoreError::InvalidSchema(_) => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<CoreError> for MutationError {
    fn from(err: CoreError) -> Self {
        Self::from(&err)
    }
}

/// What happened to one pushed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Executed and committed.
    Applied,
    /// Already processed by an earlier push; not re-executed.
    AlreadyProcessed,
    /// Rejected. The mutation is consumed and will not be retried.
    Rejected(MutationError),
}

/// Result for one mutation of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    /// Client mutation id.
    pub id: u64,
    /// Result.
    pub outcome: Outcome,
}

impl MutationOutcome {
    /// An applied mutation.
    pub fn applied(id: u64) -> Self {
        Self {
            id,
            outcome: Outcome::Applied,
        }
    }

    /// A duplicate mutation.
    pub fn already_processed(id: u64) -> Self {
        Self {
            id,
            outcome: Outcome::AlreadyProcessed,
        }
    }

    /// A rejected mutation.
    pub fn rejected(id: u64, error: MutationError) -> Self {
        Self {
            id,
            outcome: Outcome::Rejected(error),
        }
    }

    /// Returns true unless rejected.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, Outcome::Rejected(_))
    }

    /// The rejection, if any.
    pub fn error(&self) -> Option<&MutationError> {
        match &self.outcome {
            Outcome::Rejected(err) => Some(err),
            _ => None,
        }
    }
}
