//! # rowsync core
//!
//! Shared model of the rowsync engine, used identically by client and server.
//!
//! This crate provides:
//! - `Value`, `Row` and `RowKey`
//! - The schema registry (tables, primary keys, relationships)
//! - Predicate conditions with SQL null semantics
//! - Row-level permission rules
//! - Query definitions, resolution and execution
//! - Mutations, the mutator registry and the transaction context
//!
//! ## Key Invariants
//!
//! - The registry is validated once and immutable afterwards
//! - Predicates are data and evaluate the same on both sides
//! - Query results are totally ordered (primary key breaks ties)
//! - Built-in mutations are idempotent

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod expr;
mod identity;
pub mod mutation;
mod permission;
pub mod query;
mod schema;
mod value;

pub use error::{CoreError, CoreResult};
pub use expr::{col, CompareOp, Condition, Operand};
pub use identity::{Identity, IdentityField};
pub use mutation::{
    CrudOp, DeferredTask, Location, Mutation, MutationKind, MutationOp, Mutator,
    MutatorRegistry, TaskResult, Transaction, TxStore,
};
pub use permission::{Action, PermissionBuilder, PermissionSet, Policy, TablePermissions};
pub use query::{Cursor, Direction, Query, ResolvedQuery, ResultRow, RowSource};
pub use schema::{
    Cardinality, ColumnDef, ColumnType, Relationship, SchemaBuilder, SchemaRegistry,
    TableBuilder, TableSchema,
};
pub use value::{Row, RowKey, Value};

/// Generates a fresh row id.
///
/// Ids are created on the client so that a retried insert carries the same
/// key and stays idempotent.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
