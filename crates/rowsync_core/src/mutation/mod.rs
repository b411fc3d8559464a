//! Mutation definitions and the mutator registry.
//!
//! A [`Mutation`] is what a client queues and pushes: an id (increasing per
//! client) and a [`MutationKind`]. Built-in CRUD mutations are checked
//! against the permission set; custom mutators are shared code registered in
//! a [`MutatorRegistry`] and perform their own checks inside the
//! [`Transaction`].

mod tx;

pub use tx::{DeferredTask, Location, TaskResult, Transaction, TxStore};

use crate::error::{CoreError, CoreResult};
use crate::schema::SchemaRegistry;
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Operation selector passed to the client's `mutate`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationOp {
    /// Create the row unless its key exists.
    Insert,
    /// Create or replace the row.
    Upsert,
    /// Merge fields into an existing row.
    Update,
    /// Remove the row with the given key.
    Delete,
    /// A registered custom mutator.
    Custom(String),
}

impl MutationOp {
    /// Shorthand for [`MutationOp::Custom`].
    pub fn custom(name: impl Into<String>) -> Self {
        MutationOp::Custom(name.into())
    }
}

/// A built-in row operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudOp {
    /// Create the row; no-op if the key exists.
    Insert {
        /// Table.
        table: String,
        /// Full row.
        row: Row,
    },
    /// Create or fully replace the row.
    Upsert {
        /// Table.
        table: String,
        /// Full row.
        row: Row,
    },
    /// Merge the given columns into the row; no-op if absent.
    Update {
        /// Table.
        table: String,
        /// Primary key plus the changed columns.
        patch: Row,
        /// Version the client saw, checked under a strict conflict policy.
        expected_version: Option<u64>,
    },
    /// Remove the row; no-op if absent.
    Delete {
        /// Table.
        table: String,
        /// Primary key columns.
        key: Row,
        /// Version the client saw, checked under a strict conflict policy.
        expected_version: Option<u64>,
    },
}

impl CrudOp {
    /// The target table.
    pub fn table(&self) -> &str {
        match self {
            CrudOp::Insert { table, .. }
            | CrudOp::Upsert { table, .. }
            | CrudOp::Update { table, .. }
            | CrudOp::Delete { table, .. } => table,
        }
    }

    /// The row or key carried by the operation.
    pub fn payload(&self) -> &Row {
        match self {
            CrudOp::Insert { row, .. } | CrudOp::Upsert { row, .. } => row,
            CrudOp::Update { patch, .. } => patch,
            CrudOp::Delete { key, .. } => key,
        }
    }

    /// Records the version the client based this operation on.
    pub fn set_expected_version(&mut self, version: u64) {
        match self {
            CrudOp::Update {
                expected_version, ..
            }
            | CrudOp::Delete {
                expected_version, ..
            } => *expected_version = Some(version),
            CrudOp::Insert { .. } | CrudOp::Upsert { .. } => {}
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            CrudOp::Insert { .. } => "insert",
            CrudOp::Upsert { .. } => "upsert",
            CrudOp::Update { .. } => "update",
            CrudOp::Delete { .. } => "delete",
        }
    }
}

/// What a mutation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// A built-in operation.
    Crud(CrudOp),
    /// A named custom mutator.
    Custom {
        /// Table the mutator is registered under.
        table: String,
        /// Mutator name.
        name: String,
        /// Argument record.
        args: Row,
    },
}

impl MutationKind {
    /// Builds the mutation kind for `mutate(table, op, payload)`.
    pub fn new(table: &str, op: MutationOp, payload: Row) -> Self {
        let table = table.to_string();
        match op {
            MutationOp::Insert => MutationKind::Crud(CrudOp::Insert {
                table,
                row: payload,
            }),
            MutationOp::Upsert => MutationKind::Crud(CrudOp::Upsert {
                table,
                row: payload,
            }),
            MutationOp::Update => MutationKind::Crud(CrudOp::Update {
                table,
                patch: payload,
                expected_version: None,
            }),
            MutationOp::Delete => MutationKind::Crud(CrudOp::Delete {
                table,
                key: payload,
                expected_version: None,
            }),
            MutationOp::Custom(name) => MutationKind::Custom {
                table,
                name,
                args: payload,
            },
        }
    }

    /// The table the mutation targets.
    pub fn table(&self) -> &str {
        match self {
            MutationKind::Crud(op) => op.table(),
            MutationKind::Custom { table, .. } => table,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Crud(op) => write!(f, "{}.{}", op.table(), op.verb()),
            MutationKind::Custom { table, name, .. } => write!(f, "{table}.{name}"),
        }
    }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Client-local id, strictly increasing from 1 in submission order.
    pub id: u64,
    /// What to do.
    pub kind: MutationKind,
}

impl Mutation {
    /// Creates a mutation.
    pub fn new(id: u64, kind: MutationKind) -> Self {
        Self { id, kind }
    }

    /// Runs the mutation inside `tx`.
    ///
    /// Built-in operations go through the permission set; custom mutators
    /// run with full access and do their own checks.
    pub fn execute(&self, tx: &mut Transaction<'_>, mutators: &MutatorRegistry) -> CoreResult<()> {
        match &self.kind {
            MutationKind::Crud(op) => tx.apply_crud(op),
            MutationKind::Custom { table, name, args } => {
                mutators.get(table, name)?.run(tx, args)
            }
        }
    }
}

/// A custom mutator. Implemented for plain functions and closures.
pub trait Mutator: Send + Sync {
    /// Applies the mutation to `tx`.
    fn run(&self, tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()>;
}

impl<F> Mutator for F
where
    F: Fn(&mut Transaction<'_>, &Row) -> CoreResult<()> + Send + Sync,
{
    fn run(&self, tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()> {
        self(tx, args)
    }
}

/// Custom mutators keyed by `(table, name)`.
#[derive(Clone, Default)]
pub struct MutatorRegistry {
    mutators: BTreeMap<(String, String), Arc<dyn Mutator>>,
}

impl fmt::Debug for MutatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.mutators.keys().map(|(t, n)| format!("{t}.{n}")))
            .finish()
    }
}

impl MutatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutator shared by client and server.
    pub fn register<M: Mutator + 'static>(
        mut self,
        table: impl Into<String>,
        name: impl Into<String>,
        mutator: M,
    ) -> Self {
        self.mutators
            .insert((table.into(), name.into()), Arc::new(mutator));
        self
    }

    /// Replaces a registered mutator with a server-only implementation.
    pub fn override_mutator<M: Mutator + 'static>(
        mut self,
        table: &str,
        name: &str,
        mutator: M,
    ) -> CoreResult<Self> {
        let key = (table.to_string(), name.to_string());
        if !self.mutators.contains_key(&key) {
            return Err(CoreError::UnknownMutator(format!("{table}.{name}")));
        }
        self.mutators.insert(key, Arc::new(mutator));
        Ok(self)
    }

    /// Looks up a mutator.
    pub fn get(&self, table: &str, name: &str) -> CoreResult<&dyn Mutator> {
        self.mutators
            .get(&(table.to_string(), name.to_string()))
            .map(|m| m.as_ref())
            .ok_or_else(|| CoreError::UnknownMutator(format!("{table}.{name}")))
    }

    /// Returns true if a mutator is registered.
    pub fn contains(&self, table: &str, name: &str) -> bool {
        self.mutators
            .contains_key(&(table.to_string(), name.to_string()))
    }

    /// Checks that every mutator is registered on a declared table.
    pub fn validate(&self, registry: &SchemaRegistry) -> CoreResult<()> {
        for (table, _) in self.mutators.keys() {
            registry.table(table)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_op() {
        let kind = MutationKind::new("block", MutationOp::Delete, Row::new().with("id", "b1"));
        assert_eq!(kind.to_string(), "block.delete");
        assert_eq!(kind.table(), "block");

        let kind = MutationKind::new("booking", MutationOp::custom("reserve"), Row::new());
        assert_eq!(kind.to_string(), "booking.reserve");
    }

    #[test]
    fn expected_version_only_for_update_and_delete() {
        let mut insert = CrudOp::Insert {
            table: "t".into(),
            row: Row::new(),
        };
        insert.set_expected_version(3);
        assert!(matches!(insert, CrudOp::Insert { .. }));

        let mut update = match MutationKind::new("t", MutationOp::Update, Row::new()) {
            MutationKind::Crud(op) => op,
            other => panic!("unexpected {other:?}"),
        };
        update.set_expected_version(3);
        assert!(matches!(
            update,
            CrudOp::Update {
                expected_version: Some(3),
                ..
            }
        ));
    }

    #[test]
    fn registry_lookup_and_override() {
        fn noop(_: &mut Transaction<'_>, _: &Row) -> CoreResult<()> {
            Ok(())
        }
        let registry = MutatorRegistry::new().register("booking", "reserve", noop);
        assert!(registry.contains("booking", "reserve"));
        assert!(matches!(
            registry.get("booking", "cancel"),
            Err(CoreError::UnknownMutator(_))
        ));
        assert!(registry
            .clone()
            .override_mutator("booking", "reserve", noop)
            .is_ok());
        assert!(registry.override_mutator("booking", "cancel", noop).is_err());
    }
}
