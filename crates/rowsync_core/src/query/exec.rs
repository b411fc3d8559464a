//! Query resolution and one-shot execution.
//!
//! The client's live views reuse the same [`ResolvedQuery`] methods to test
//! membership, compute sort keys and expand relationships incrementally;
//! [`ResolvedQuery::execute`] is the from-scratch path used by the server,
//! by view initialization and by tests.

use super::sort::{SortKey, SortSpec};
use super::{Cursor, Query};
use crate::error::{CoreError, CoreResult};
use crate::expr::Condition;
use crate::identity::Identity;
use crate::permission::PermissionSet;
use crate::schema::{Cardinality, Relationship, SchemaRegistry};
use crate::value::Row;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Anything that can enumerate the rows of a table.
pub trait RowSource {
    /// Calls `visit` once for every row of `table`, in any order.
    fn for_each_row(&self, table: &str, visit: &mut dyn FnMut(&Row));
}

impl RowSource for BTreeMap<String, Vec<Row>> {
    fn for_each_row(&self, table: &str, visit: &mut dyn FnMut(&Row)) {
        for row in self.get(table).into_iter().flatten() {
            visit(row);
        }
    }
}

/// One result row with its relationship expansions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    /// The row itself.
    pub row: Row,
    /// Expansions by relationship name.
    pub related: BTreeMap<String, Related>,
}

impl ResultRow {
    /// A result row with no expansions.
    pub fn plain(row: Row) -> Self {
        Self {
            row,
            related: BTreeMap::new(),
        }
    }

    /// The single related row under `name`, if any.
    pub fn one(&self, name: &str) -> Option<&ResultRow> {
        match self.related.get(name)? {
            Related::One(row) => row.as_deref(),
            Related::Many(rows) => rows.first(),
        }
    }

    /// The related rows under `name` (empty when absent).
    pub fn many(&self, name: &str) -> &[ResultRow] {
        match self.related.get(name) {
            Some(Related::Many(rows)) => rows,
            Some(Related::One(Some(row))) => std::slice::from_ref(row.as_ref()),
            _ => &[],
        }
    }
}

/// A relationship expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Related {
    /// At most one row.
    One(Option<Box<ResultRow>>),
    /// A bounded ordered collection.
    Many(Vec<ResultRow>),
}

/// A relationship expansion resolved against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedRelated {
    /// Relationship name.
    pub name: String,
    /// The declared relationship.
    pub relationship: Relationship,
    /// Sub-query over the destination table.
    pub query: ResolvedQuery,
}

impl ResolvedRelated {
    /// Returns true if the expansion yields at most one row.
    pub fn is_one(&self) -> bool {
        self.query.one || self.relationship.cardinality == Cardinality::One
    }

    /// Returns true if `child` is joined to `parent` and passes the
    /// sub-query's filter.
    pub fn joins(&self, parent: &Row, child: &Row) -> bool {
        match (
            self.relationship.source_values(parent),
            self.relationship.dest_values(child),
        ) {
            (Some(a), Some(b)) => a == b && self.query.matches(child),
            _ => false,
        }
    }

    /// Computes the expansion of one parent row.
    pub fn collect(&self, parent: &Row, source: &dyn RowSource) -> Related {
        let mut matches = BTreeMap::new();
        if self.relationship.source_values(parent).is_some() {
            source.for_each_row(&self.relationship.dest_table, &mut |child| {
                if self.joins(parent, child) {
                    matches.insert(self.query.sort_key(child), child.clone());
                }
            });
        }
        let rows: Vec<ResultRow> = self
            .query
            .window(matches.iter())
            .map(|(_, row)| self.query.expand(row.clone(), source))
            .collect();
        if self.is_one() {
            Related::One(rows.into_iter().next().map(Box::new))
        } else {
            Related::Many(rows)
        }
    }
}

/// A query bound to the registry, the permission set and one identity.
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    table: String,
    filter: Condition,
    sort: SortSpec,
    limit: Option<usize>,
    start: Option<(SortKey, bool)>,
    related: Vec<ResolvedRelated>,
    one: bool,
    identity: Option<Identity>,
}

impl ResolvedQuery {
    /// Validates `query` and ANDs the read filter of every table it touches
    /// into the corresponding filter.
    pub fn resolve(
        query: &Query,
        registry: &SchemaRegistry,
        permissions: &PermissionSet,
        identity: Option<&Identity>,
    ) -> CoreResult<Self> {
        Self::resolve_as(query, query.table_name(), registry, permissions, identity)
    }

    fn resolve_as(
        query: &Query,
        table_name: &str,
        registry: &SchemaRegistry,
        permissions: &PermissionSet,
        identity: Option<&Identity>,
    ) -> CoreResult<Self> {
        let schema = registry.table(table_name)?;
        query.filter_condition().validate(schema)?;
        for (column, _) in query.ordering() {
            schema.require_column(column)?;
        }
        let sort = SortSpec::new(query.ordering(), &schema.primary_key);

        let start = match query.start_position() {
            Some(start) if start.cursor.0.len() > sort.columns().len() => {
                return Err(CoreError::validation(format!(
                    "{table_name}: cursor has {} values, ordering has {}",
                    start.cursor.0.len(),
                    sort.columns().len()
                )));
            }
            Some(start) => Some((sort.key_from_values(&start.cursor.0), start.inclusive)),
            None => None,
        };

        let mut related = Vec::with_capacity(query.related_queries().len());
        for rq in query.related_queries() {
            let relationship = registry.relationship(table_name, &rq.name)?.clone();
            let sub = Self::resolve_as(
                &rq.query,
                &relationship.dest_table,
                registry,
                permissions,
                identity,
            )?;
            related.push(ResolvedRelated {
                name: rq.name.clone(),
                relationship,
                query: sub,
            });
        }

        let filter = query
            .filter_condition()
            .clone()
            .and(permissions.read_filter(table_name, identity));

        Ok(Self {
            table: table_name.to_string(),
            filter,
            sort,
            limit: query.row_limit(),
            start,
            related,
            one: query.is_one(),
            identity: identity.cloned(),
        })
    }

    /// The queried table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The effective filter (query filter AND read filter).
    pub fn filter(&self) -> &Condition {
        &self.filter
    }

    /// The row limit.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// The relationship expansions.
    pub fn related(&self) -> &[ResolvedRelated] {
        &self.related
    }

    /// The identity the query was resolved for.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Every table whose rows can affect the result.
    pub fn tables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tables(&mut out);
        out
    }

    fn collect_tables(&self, out: &mut BTreeSet<String>) {
        out.insert(self.table.clone());
        for rel in &self.related {
            rel.query.collect_tables(out);
        }
    }

    /// Returns true if `row` passes the effective filter.
    pub fn matches(&self, row: &Row) -> bool {
        self.filter.evaluate(row, self.identity.as_ref())
    }

    /// The sort key of `row`.
    pub fn sort_key(&self, row: &Row) -> SortKey {
        self.sort.key(row)
    }

    /// The cursor that resumes after `row`.
    pub fn cursor(&self, row: &Row) -> Cursor {
        Cursor(self.sort.key(row).values().cloned().collect())
    }

    /// Returns true if `key` is at or past the start position.
    pub fn after_start(&self, key: &SortKey) -> bool {
        match &self.start {
            None => true,
            Some((cursor, inclusive)) => match key.cmp_prefix(cursor) {
                Ordering::Greater => true,
                Ordering::Equal => *inclusive,
                Ordering::Less => false,
            },
        }
    }

    /// Applies the start position and limit to entries already in sort order.
    pub fn window<'a, T: 'a, I>(&'a self, sorted: I) -> impl Iterator<Item = (&'a SortKey, T)> + 'a
    where
        I: Iterator<Item = (&'a SortKey, T)> + 'a,
    {
        sorted
            .skip_while(move |(key, _)| !self.after_start(key))
            .take(self.limit.unwrap_or(usize::MAX))
    }

    /// Attaches every relationship expansion to `row`.
    pub fn expand(&self, row: Row, source: &dyn RowSource) -> ResultRow {
        let related = self
            .related
            .iter()
            .map(|rel| (rel.name.clone(), rel.collect(&row, source)))
            .collect();
        ResultRow { row, related }
    }

    /// Runs the query from scratch.
    pub fn execute(&self, source: &dyn RowSource) -> Vec<ResultRow> {
        let mut matches = BTreeMap::new();
        source.for_each_row(&self.table, &mut |row| {
            if self.matches(row) {
                matches.insert(self.sort_key(row), row.clone());
            }
        });
        self.window(matches.iter())
            .map(|(_, row)| self.expand(row.clone(), source))
            .collect()
    }
}
