//! The transaction context mutators run in.

use super::CrudOp;
use crate::error::{CoreError, CoreResult};
use crate::identity::Identity;
use crate::permission::PermissionSet;
use crate::query::{Query, ResolvedQuery, ResultRow, RowSource};
use crate::schema::SchemaRegistry;
use crate::value::{Row, RowKey};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Result of a deferred side task.
pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Row storage a [`Transaction`] reads and writes.
///
/// The client implements it over its optimistic overlay and the server over
/// the staged writes of a store transaction.
pub trait TxStore: RowSource {
    /// Current row under `key`.
    fn get(&self, table: &str, key: &RowKey) -> Option<Row>;

    /// Current version of the row under `key` (0 when absent).
    fn version(&self, table: &str, key: &RowKey) -> u64;

    /// Writes a full row.
    fn put(&mut self, table: &str, key: RowKey, row: Row);

    /// Removes a row.
    fn remove(&mut self, table: &str, key: &RowKey);
}

/// Where a transaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Optimistically, on the client.
    Client,
    /// Authoritatively, on the server.
    Server,
}

/// A side task queued by a mutator, run after the server commits.
pub struct DeferredTask {
    name: String,
    task: Box<dyn FnOnce() -> TaskResult + Send>,
}

impl DeferredTask {
    /// Wraps a task.
    pub fn new<F>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        Self {
            name: name.into(),
            task: Box::new(task),
        }
    }

    /// The task's name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the task.
    pub fn run(self) -> TaskResult {
        (self.task)()
    }
}

impl fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Mutation context.
///
/// Writes go straight to the underlying [`TxStore`]; committing or
/// discarding them is the caller's business. The keys touched by the
/// transaction are recorded so the caller can compute what changed.
pub struct Transaction<'a> {
    store: &'a mut dyn TxStore,
    registry: &'a SchemaRegistry,
    permissions: &'a PermissionSet,
    identity: Option<&'a Identity>,
    location: Location,
    check_versions: bool,
    touched: BTreeSet<(String, RowKey)>,
    deferred: Vec<DeferredTask>,
}

impl<'a> Transaction<'a> {
    /// Opens a transaction over `store`.
    pub fn new(
        store: &'a mut dyn TxStore,
        registry: &'a SchemaRegistry,
        permissions: &'a PermissionSet,
        identity: Option<&'a Identity>,
        location: Location,
    ) -> Self {
        Self {
            store,
            registry,
            permissions,
            identity,
            location,
            check_versions: false,
            touched: BTreeSet::new(),
            deferred: Vec::new(),
        }
    }

    /// Enables rejection of updates and deletes whose expected version is
    /// stale.
    pub fn with_version_checks(mut self, enabled: bool) -> Self {
        self.check_versions = enabled;
        self
    }

    /// The authenticated identity, or `NotAuthenticated`.
    pub fn identity(&self) -> CoreResult<&Identity> {
        self.identity.ok_or(CoreError::NotAuthenticated)
    }

    /// The identity, if any.
    pub fn identity_opt(&self) -> Option<&Identity> {
        self.identity
    }

    /// Where the transaction runs.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Returns true on the server.
    pub fn is_server(&self) -> bool {
        self.location == Location::Server
    }

    /// The schema registry.
    pub fn registry(&self) -> &SchemaRegistry {
        self.registry
    }

    /// Reads the row whose primary key columns are given in `key`.
    pub fn get(&self, table: &str, key: &Row) -> CoreResult<Option<Row>> {
        let key = self.registry.table(table)?.row_key(key)?;
        Ok(self.store.get(table, &key))
    }

    /// Runs a query against the transaction's current state. Read rules do
    /// not apply inside mutators.
    pub fn query(&self, query: &Query) -> CoreResult<Vec<ResultRow>> {
        let resolved =
            ResolvedQuery::resolve(query, self.registry, &PermissionSet::open(), self.identity)?;
        Ok(resolved.execute(&*self))
    }

    /// Inserts a row unless its key exists.
    pub fn insert(&mut self, table: &str, row: Row) -> CoreResult<()> {
        self.insert_row(table, row, false)
    }

    /// Creates or replaces a row.
    pub fn upsert(&mut self, table: &str, row: Row) -> CoreResult<()> {
        self.upsert_row(table, row, false)
    }

    /// Merges `patch` into an existing row.
    pub fn update(&mut self, table: &str, patch: Row) -> CoreResult<()> {
        self.update_row(table, patch, None, false)
    }

    /// Deletes the row whose primary key columns are given in `key`.
    pub fn delete(&mut self, table: &str, key: Row) -> CoreResult<()> {
        self.delete_row(table, key, None, false)
    }

    /// Applies a built-in operation with permission checks.
    pub fn apply_crud(&mut self, op: &CrudOp) -> CoreResult<()> {
        match op {
            CrudOp::Insert { table, row } => self.insert_row(table, row.clone(), true),
            CrudOp::Upsert { table, row } => self.upsert_row(table, row.clone(), true),
            CrudOp::Update {
                table,
                patch,
                expected_version,
            } => self.update_row(table, patch.clone(), *expected_version, true),
            CrudOp::Delete {
                table,
                key,
                expected_version,
            } => self.delete_row(table, key.clone(), *expected_version, true),
        }
    }

    /// Queues a side task to run after commit. Only the server runs them.
    pub fn defer<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let name = name.into();
        if self.is_server() {
            self.deferred.push(DeferredTask::new(name, task));
        } else {
            debug!(task = %name, "skipping deferred task on client");
        }
    }

    /// Keys written by this transaction.
    pub fn touched(&self) -> &BTreeSet<(String, RowKey)> {
        &self.touched
    }

    /// Ends the transaction, returning the touched keys and queued tasks.
    pub fn finish(self) -> (BTreeSet<(String, RowKey)>, Vec<DeferredTask>) {
        (self.touched, self.deferred)
    }

    fn insert_row(&mut self, table: &str, row: Row, checked: bool) -> CoreResult<()> {
        let schema = self.registry.table(table)?;
        schema.validate_row(&row)?;
        let key = schema.row_key(&row)?;
        if self.store.get(table, &key).is_some() {
            return Ok(());
        }
        if checked {
            self.permissions
                .authorize_insert(table, &row, self.identity)?;
        }
        self.write(table, key, Some(row));
        Ok(())
    }

    fn upsert_row(&mut self, table: &str, row: Row, checked: bool) -> CoreResult<()> {
        let schema = self.registry.table(table)?;
        schema.validate_row(&row)?;
        let key = schema.row_key(&row)?;
        if checked {
            match self.store.get(table, &key) {
                Some(old) => self
                    .permissions
                    .authorize_update(table, &old, &row, self.identity)?,
                None => self
                    .permissions
                    .authorize_insert(table, &row, self.identity)?,
            }
        }
        self.write(table, key, Some(row));
        Ok(())
    }

    fn update_row(
        &mut self,
        table: &str,
        patch: Row,
        expected: Option<u64>,
        checked: bool,
    ) -> CoreResult<()> {
        let schema = self.registry.table(table)?;
        schema.validate_patch(&patch)?;
        let key = schema.row_key(&patch)?;
        self.check_version(table, &key, expected)?;
        let Some(old) = self.store.get(table, &key) else {
            return Ok(());
        };
        let mut new = old.clone();
        new.merge(&patch);
        if schema.row_key(&new)? != key {
            return Err(CoreError::validation(format!(
                "{table}: primary key cannot change"
            )));
        }
        if checked {
            self.permissions
                .authorize_update(table, &old, &new, self.identity)?;
        }
        self.write(table, key, Some(new));
        Ok(())
    }

    fn delete_row(
        &mut self,
        table: &str,
        key_row: Row,
        expected: Option<u64>,
        checked: bool,
    ) -> CoreResult<()> {
        let key = self.registry.table(table)?.row_key(&key_row)?;
        self.check_version(table, &key, expected)?;
        let Some(old) = self.store.get(table, &key) else {
            return Ok(());
        };
        if checked {
            self.permissions
                .authorize_delete(table, &old, self.identity)?;
        }
        self.write(table, key, None);
        Ok(())
    }

    fn check_version(&self, table: &str, key: &RowKey, expected: Option<u64>) -> CoreResult<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        if !self.check_versions {
            return Ok(());
        }
        let actual = self.store.version(table, key);
        if actual != expected {
            return Err(CoreError::Conflict {
                table: table.to_string(),
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn write(&mut self, table: &str, key: RowKey, row: Option<Row>) {
        match row {
            Some(row) => self.store.put(table, key.clone(), row),
            None => self.store.remove(table, &key),
        }
        self.touched.insert((table.to_string(), key));
    }
}

impl RowSource for Transaction<'_> {
    fn for_each_row(&self, table: &str, visit: &mut dyn FnMut(&Row)) {
        self.store.for_each_row(table, visit);
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("location", &self.location)
            .field("identity", &self.identity)
            .field("touched", &self.touched.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::identity::IdentityField;
    use crate::mutation::{Mutation, MutationKind, MutationOp, MutatorRegistry};
    use crate::permission::{Policy, TablePermissions};
    use crate::schema::{ColumnType, TableSchema};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapStore {
        rows: BTreeMap<(String, RowKey), (Row, u64)>,
    }

    impl RowSource for MapStore {
        fn for_each_row(&self, table: &str, visit: &mut dyn FnMut(&Row)) {
            for ((t, _), (row, _)) in &self.rows {
                if t == table {
                    visit(row);
                }
            }
        }
    }

    impl TxStore for MapStore {
        fn get(&self, table: &str, key: &RowKey) -> Option<Row> {
            self.rows
                .get(&(table.to_string(), key.clone()))
                .map(|(r, _)| r.clone())
        }

        fn version(&self, table: &str, key: &RowKey) -> u64 {
            self.rows
                .get(&(table.to_string(), key.clone()))
                .map_or(0, |(_, v)| *v)
        }

        fn put(&mut self, table: &str, key: RowKey, row: Row) {
            let entry = self
                .rows
                .entry((table.to_string(), key))
                .or_insert((Row::new(), 0));
            entry.0 = row;
            entry.1 += 1;
        }

        fn remove(&mut self, table: &str, key: &RowKey) {
            self.rows.remove(&(table.to_string(), key.clone()));
        }
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .table(
                TableSchema::builder("block")
                    .column("id", ColumnType::Text)
                    .column("blockerId", ColumnType::Text)
                    .optional("reason", ColumnType::Text)
                    .primary_key(["id"])
                    .build(),
            )
            .build()
            .unwrap()
    }

    fn permissions(registry: &SchemaRegistry) -> PermissionSet {
        let owner = Policy::Allow(col("blockerId").eq_identity(IdentityField::Id));
        PermissionSet::builder()
            .table(
                "block",
                TablePermissions::new()
                    .insert(owner.clone())
                    .update(owner.clone())
                    .delete(owner),
            )
            .build(registry)
            .unwrap()
    }

    fn block(id: &str, blocker: &str) -> Row {
        Row::new().with("id", id).with("blockerId", blocker)
    }

    #[test]
    fn builtins_are_idempotent() {
        let reg = registry();
        let perms = permissions(&reg);
        let who = Identity::new("A");
        let mut store = MapStore::default();

        let ops = [
            CrudOp::Insert {
                table: "block".into(),
                row: block("b1", "A"),
            },
            CrudOp::Insert {
                table: "block".into(),
                row: block("b1", "A").with("reason", "dup"),
            },
        ];
        let mut tx = Transaction::new(&mut store, &reg, &perms, Some(&who), Location::Server);
        for op in &ops {
            tx.apply_crud(op).unwrap();
        }
        assert_eq!(tx.touched().len(), 1);
        drop(tx);
        let key = RowKey::single("b1");
        assert_eq!(store.get("block", &key), Some(block("b1", "A")));

        let delete = CrudOp::Delete {
            table: "block".into(),
            key: Row::new().with("id", "b1"),
            expected_version: None,
        };
        let mut tx = Transaction::new(&mut store, &reg, &perms, Some(&who), Location::Server);
        tx.apply_crud(&delete).unwrap();
        tx.apply_crud(&delete).unwrap();
        drop(tx);
        assert_eq!(store.get("block", &key), None);
    }

    #[test]
    fn update_merges_and_ignores_missing_rows() {
        let reg = registry();
        let perms = permissions(&reg);
        let who = Identity::new("A");
        let mut store = MapStore::default();
        store.put("block", RowKey::single("b1"), block("b1", "A"));

        let mut tx = Transaction::new(&mut store, &reg, &perms, Some(&who), Location::Client);
        tx.update("block", Row::new().with("id", "b1").with("reason", "spam"))
            .unwrap();
        tx.update("block", Row::new().with("id", "zz").with("reason", "x"))
            .unwrap();
        let (touched, _) = tx.finish();
        assert_eq!(touched.len(), 1);
        assert_eq!(
            store.get("block", &RowKey::single("b1")),
            Some(block("b1", "A").with("reason", "spam"))
        );
    }

    #[test]
    fn permission_checks_apply_to_builtins_only() {
        let reg = registry();
        let perms = permissions(&reg);
        let mut store = MapStore::default();

        let insert = CrudOp::Insert {
            table: "block".into(),
            row: block("b1", "A"),
        };
        let mut tx = Transaction::new(&mut store, &reg, &perms, None, Location::Server);
        assert_eq!(tx.apply_crud(&insert), Err(CoreError::NotAuthenticated));
        // Custom mutators write without the table rules.
        tx.insert("block", block("b1", "A")).unwrap();
        drop(tx);

        let other = Identity::new("B");
        let mut tx = Transaction::new(&mut store, &reg, &perms, Some(&other), Location::Server);
        let delete = CrudOp::Delete {
            table: "block".into(),
            key: Row::new().with("id", "b1"),
            expected_version: None,
        };
        assert!(matches!(
            tx.apply_crud(&delete),
            Err(CoreError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn stale_versions_conflict_when_checked() {
        let reg = registry();
        let perms = permissions(&reg);
        let who = Identity::new("A");
        let mut store = MapStore::default();
        store.put("block", RowKey::single("b1"), block("b1", "A"));
        store.put("block", RowKey::single("b1"), block("b1", "A"));

        let stale = CrudOp::Update {
            table: "block".into(),
            patch: Row::new().with("id", "b1").with("reason", "x"),
            expected_version: Some(1),
        };
        let mut tx = Transaction::new(&mut store, &reg, &perms, Some(&who), Location::Server)
            .with_version_checks(true);
        assert!(matches!(
            tx.apply_crud(&stale),
            Err(CoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));
        drop(tx);

        let mut tx = Transaction::new(&mut store, &reg, &perms, Some(&who), Location::Server);
        tx.apply_crud(&stale).unwrap();
    }

    #[test]
    fn custom_mutator_and_deferred_tasks() {
        fn block_user(tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()> {
            let me = tx.identity()?.id.clone();
            let id = args.text("id")?.to_string();
            tx.insert("block", Row::new().with("id", id).with("blockerId", me))?;
            tx.defer("notify", || Ok(()));
            Ok(())
        }

        let reg = registry();
        let perms = permissions(&reg);
        let mutators = MutatorRegistry::new().register("block", "blockUser", block_user);
        let mutation = Mutation::new(
            1,
            MutationKind::new(
                "block",
                MutationOp::custom("blockUser"),
                Row::new().with("id", "b9"),
            ),
        );
        let who = Identity::new("A");

        let mut store = MapStore::default();
        let mut tx = Transaction::new(&mut store, &reg, &perms, Some(&who), Location::Server);
        mutation.execute(&mut tx, &mutators).unwrap();
        let (_, deferred) = tx.finish();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].name(), "notify");

        let mut client_store = MapStore::default();
        let mut tx = Transaction::new(&mut client_store, &reg, &perms, Some(&who), Location::Client);
        mutation.execute(&mut tx, &mutators).unwrap();
        assert!(tx.finish().1.is_empty());

        let mut tx = Transaction::new(&mut client_store, &reg, &perms, None, Location::Client);
        assert_eq!(
            mutation.execute(&mut tx, &mutators),
            Err(CoreError::NotAuthenticated)
        );
    }

    #[test]
    fn query_inside_transaction() {
        let reg = registry();
        let perms = permissions(&reg);
        let mut store = MapStore::default();
        store.put("block", RowKey::single("b1"), block("b1", "A"));
        store.put("block", RowKey::single("b2"), block("b2", "B"));

        let tx = Transaction::new(&mut store, &reg, &perms, None, Location::Server);
        let rows = tx
            .query(&Query::table("block").filter(col("blockerId").eq("B")))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row.text("id").unwrap(), "b2");
    }
}
