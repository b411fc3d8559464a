//! Query definitions.
//!
//! A [`Query`] is plain data built with a fluent API:
//!
//! ```
//! use rowsync_core::query::{Direction, Query};
//! use rowsync_core::expr::col;
//!
//! let q = Query::table("booking")
//!     .filter(col("status").eq("open"))
//!     .order_by("startsAt", Direction::Asc)
//!     .limit(20)
//!     .related("user", |r| r.one());
//! assert_eq!(q.table_name(), "booking");
//! ```
//!
//! Before it can run, a query is resolved against the schema registry and
//! the permission set for one identity (see [`ResolvedQuery`]).

mod exec;
mod sort;

pub use exec::{Related, ResolvedQuery, ResolvedRelated, ResultRow, RowSource};
pub use sort::{Direction, SortKey, SortSpec, SortValue};

use crate::expr::Condition;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Sort-key values of a row, used to resume a query after that row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub Vec<Value>);

/// Where a query's output window begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    /// Position.
    pub cursor: Cursor,
    /// Whether the row at the cursor itself is included.
    pub inclusive: bool,
}

/// Expansion of a relationship attached to every result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedQuery {
    /// Relationship name on the parent table.
    pub name: String,
    /// Sub-query over the destination table. Its table name is filled in
    /// from the relationship during resolution.
    pub query: Query,
}

/// A query over one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    table: String,
    filter: Condition,
    order: Vec<(String, Direction)>,
    limit: Option<usize>,
    start: Option<Start>,
    related: Vec<RelatedQuery>,
    one: bool,
}

impl Query {
    /// Starts a query over `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Condition::Always,
            order: Vec::new(),
            limit: None,
            start: None,
            related: Vec::new(),
            one: false,
        }
    }

    /// ANDs a condition into the filter.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = std::mem::replace(&mut self.filter, Condition::Always).and(condition);
        self
    }

    /// Appends an ordering column.
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push((column.into(), direction));
        self
    }

    /// Limits the number of rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resumes strictly after the row at `cursor`.
    pub fn start(mut self, cursor: Cursor) -> Self {
        self.start = Some(Start {
            cursor,
            inclusive: false,
        });
        self
    }

    /// Resumes at the row at `cursor`, including it.
    pub fn start_inclusive(mut self, cursor: Cursor) -> Self {
        self.start = Some(Start {
            cursor,
            inclusive: true,
        });
        self
    }

    /// Returns at most one row.
    pub fn one(mut self) -> Self {
        self.one = true;
        self.limit = Some(1);
        self
    }

    /// Attaches a relationship expansion. The closure shapes the sub-query
    /// (filter, ordering, limit, `one`, nested `related`).
    pub fn related<F>(mut self, name: impl Into<String>, shape: F) -> Self
    where
        F: FnOnce(Query) -> Query,
    {
        let name = name.into();
        let query = shape(Query::table(String::new()));
        self.related.push(RelatedQuery { name, query });
        self
    }

    /// The table name.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// The filter condition.
    pub fn filter_condition(&self) -> &Condition {
        &self.filter
    }

    /// The declared ordering.
    pub fn ordering(&self) -> &[(String, Direction)] {
        &self.order
    }

    /// The row limit.
    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// The start position.
    pub fn start_position(&self) -> Option<&Start> {
        self.start.as_ref()
    }

    /// The relationship expansions.
    pub fn related_queries(&self) -> &[RelatedQuery] {
        &self.related
    }

    /// Whether at most one row is requested.
    pub fn is_one(&self) -> bool {
        self.one
    }
}
