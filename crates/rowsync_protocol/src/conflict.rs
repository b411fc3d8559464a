//! Conflict policy and conflict reports.

use crate::outcome::{ErrorKind, MutationError};
use rowsync_core::CoreError;
use serde::{Deserialize, Serialize};

/// How the server arbitrates concurrent writes to the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Mutations apply in server arrival order. Updates merge only the
    /// columns they carry, so edits of different columns both survive.
    #[default]
    LastWriteWins,
    /// Updates and deletes carry the row version the client saw and are
    /// rejected with a conflict if the row has moved since.
    RejectStale,
}

impl ConflictPolicy {
    /// Returns true if mutations should carry expected versions and the
    /// server should check them.
    pub fn checks_versions(&self) -> bool {
        matches!(self, ConflictPolicy::RejectStale)
    }

    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictPolicy::LastWriteWins => 1,
            ConflictPolicy::RejectStale => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictPolicy::LastWriteWins),
            2 => Some(ConflictPolicy::RejectStale),
            _ => None,
        }
    }
}

/// A stale write detected by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Table.
    pub table: String,
    /// Display form of the row key.
    pub key: String,
    /// Version the client based its change on.
    pub expected_version: u64,
    /// Version the server holds (0 when the row is gone).
    pub actual_version: u64,
}

impl Conflict {
    /// Extracts a conflict from a core error.
    pub fn from_error(err: &CoreError) -> Option<Self> {
        match err {
            CoreError::Conflict {
                table,
                key,
                expected,
                actual,
            } => Some(Self {
                table: table.clone(),
                key: key.clone(),
                expected_version: *expected,
                actual_version: *actual,
            }),
            _ => None,
        }
    }

    /// Returns true if the row was deleted concurrently.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.actual_version == 0
    }

    /// Converts into a mutation error.
    pub fn into_error(self) -> MutationError {
        MutationError::new(
            ErrorKind::Conflict,
            format!(
                "{} {} changed: expected version {}, found {}",
                self.table, self.key, self.expected_version, self.actual_version
            ),
        )
    }
}
