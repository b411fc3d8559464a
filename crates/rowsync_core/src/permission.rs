//! Row-level permission rules.
//!
//! Rules are declared per table and action as [`Policy`] values and checked
//! against the registry once, when the [`PermissionSet`] is built. The same
//! set is evaluated by the client (optimistically) and by the server
//! (authoritatively).

use crate::error::{CoreError, CoreResult};
use crate::expr::Condition;
use crate::identity::Identity;
use crate::schema::SchemaRegistry;
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Who may perform an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Anyone, including anonymous clients.
    Anyone,
    /// No one (server-only writes through custom mutators).
    Nobody,
    /// Rows for which the condition holds.
    ///
    /// Writes additionally require an identity. Reads only filter by the
    /// condition, so a condition that never mentions the identity also
    /// admits anonymous readers.
    Allow(Condition),
}

impl Policy {
    fn check(
        &self,
        table: &str,
        action: Action,
        row: &Row,
        identity: Option<&Identity>,
    ) -> CoreResult<()> {
        match (self, identity) {
            (Policy::Anyone, _) => Ok(()),
            (Policy::Allow(_), None) => Err(CoreError::NotAuthenticated),
            (Policy::Allow(cond), Some(identity)) if cond.evaluate(row, Some(identity)) => Ok(()),
            _ => Err(CoreError::denied(table, action.to_string())),
        }
    }

    fn as_filter(&self) -> Condition {
        match self {
            Policy::Anyone => Condition::Always,
            Policy::Nobody => Condition::Never,
            Policy::Allow(cond) => cond.clone(),
        }
    }

    fn condition(&self) -> Option<&Condition> {
        match self {
            Policy::Allow(cond) => Some(cond),
            _ => None,
        }
    }
}

/// Permission-checked action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read.
    Select,
    /// Built-in insert or upsert of a new row.
    Insert,
    /// Built-in update or upsert over an existing row.
    Update,
    /// Built-in delete.
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Select => "select",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

/// Rules for one table.
///
/// `update` is checked twice: `update_pre` against the row before the write
/// and `update_post` against the row after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePermissions {
    /// Read rule.
    pub select: Policy,
    /// Insert rule.
    pub insert: Policy,
    /// Update rule on the existing row.
    pub update_pre: Policy,
    /// Update rule on the resulting row.
    pub update_post: Policy,
    /// Delete rule.
    pub delete: Policy,
}

impl Default for TablePermissions {
    fn default() -> Self {
        Self {
            select: Policy::Anyone,
            insert: Policy::Nobody,
            update_pre: Policy::Nobody,
            update_post: Policy::Nobody,
            delete: Policy::Nobody,
        }
    }
}

impl TablePermissions {
    /// Readable by anyone, writable by no built-in mutation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything allowed for everyone.
    pub fn open() -> Self {
        Self {
            select: Policy::Anyone,
            insert: Policy::Anyone,
            update_pre: Policy::Anyone,
            update_post: Policy::Anyone,
            delete: Policy::Anyone,
        }
    }

    /// Sets the read rule.
    pub fn select(mut self, policy: Policy) -> Self {
        self.select = policy;
        self
    }

    /// Sets the insert rule.
    pub fn insert(mut self, policy: Policy) -> Self {
        self.insert = policy;
        self
    }

    /// Sets both update rules to the same policy.
    pub fn update(mut self, policy: Policy) -> Self {
        self.update_pre = policy.clone();
        self.update_post = policy;
        self
    }

    /// Sets the pre- and post-mutation update rules separately.
    pub fn update_split(mut self, pre: Policy, post: Policy) -> Self {
        self.update_pre = pre;
        self.update_post = post;
        self
    }

    /// Sets the delete rule.
    pub fn delete(mut self, policy: Policy) -> Self {
        self.delete = policy;
        self
    }

    fn policies(&self) -> [&Policy; 5] {
        [
            &self.select,
            &self.insert,
            &self.update_pre,
            &self.update_post,
            &self.delete,
        ]
    }
}

/// Validated permission rules for every table.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    tables: BTreeMap<String, TablePermissions>,
    fallback: TablePermissions,
}

impl PermissionSet {
    /// Starts a declaration.
    pub fn builder() -> PermissionBuilder {
        PermissionBuilder::default()
    }

    /// Permissions allowing everything on every table.
    pub fn open() -> Self {
        Self {
            tables: BTreeMap::new(),
            fallback: TablePermissions::open(),
        }
    }

    /// Rules for a table (the default rule set when none was declared).
    pub fn table(&self, table: &str) -> &TablePermissions {
        self.tables.get(table).unwrap_or(&self.fallback)
    }

    /// Condition ANDed into every read of `table`.
    pub fn read_filter(&self, table: &str, _identity: Option<&Identity>) -> Condition {
        self.table(table).select.as_filter()
    }

    /// Returns true if `identity` may read `row`.
    pub fn can_read(&self, table: &str, row: &Row, identity: Option<&Identity>) -> bool {
        self.read_filter(table, identity).evaluate(row, identity)
    }

    /// Checks a built-in insert of `row`.
    pub fn authorize_insert(
        &self,
        table: &str,
        row: &Row,
        identity: Option<&Identity>,
    ) -> CoreResult<()> {
        self.table(table)
            .insert
            .check(table, Action::Insert, row, identity)
    }

    /// Checks a built-in update from `old` to `new`.
    pub fn authorize_update(
        &self,
        table: &str,
        old: &Row,
        new: &Row,
        identity: Option<&Identity>,
    ) -> CoreResult<()> {
        let rules = self.table(table);
        rules.update_pre.check(table, Action::Update, old, identity)?;
        rules.update_post.check(table, Action::Update, new, identity)
    }

    /// Checks a built-in delete of `old`.
    pub fn authorize_delete(
        &self,
        table: &str,
        old: &Row,
        identity: Option<&Identity>,
    ) -> CoreResult<()> {
        self.table(table)
            .delete
            .check(table, Action::Delete, old, identity)
    }
}

/// Builder for a [`PermissionSet`].
#[derive(Debug, Default)]
pub struct PermissionBuilder {
    tables: Vec<(String, TablePermissions)>,
}

impl PermissionBuilder {
    /// Declares the rules of a table.
    pub fn table(mut self, table: impl Into<String>, rules: TablePermissions) -> Self {
        self.tables.push((table.into(), rules));
        self
    }

    /// Validates every rule against the registry.
    pub fn build(self, registry: &SchemaRegistry) -> CoreResult<PermissionSet> {
        let mut tables = BTreeMap::new();
        for (name, rules) in self.tables {
            let schema = registry.table(&name)?;
            for cond in rules.policies().into_iter().filter_map(Policy::condition) {
                cond.validate(schema)?;
            }
            if tables.insert(name.clone(), rules).is_some() {
                return Err(CoreError::invalid_schema(format!(
                    "permissions for `{name}` declared twice"
                )));
            }
        }
        Ok(PermissionSet {
            tables,
            fallback: TablePermissions::default(),
        })
    }
}
