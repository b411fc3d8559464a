//! Live queries.
//!
//! A live query is materialized once and then maintained incrementally:
//! every change to the effective row set (server rows plus optimistic
//! overlay) is fed through each registered view, which re-evaluates only the
//! parent rows and relationship expansions the change can affect. A new
//! snapshot is published only when the visible window or the status changes.

use crate::cache::{Changes, Layered, Replica};
use parking_lot::Mutex;
use rowsync_core::query::{Related, ResolvedQuery, ResultRow, RowSource, SortKey};
use rowsync_core::{Cursor, RowKey, SchemaRegistry, TableSchema};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// How complete a live query's result is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// The tables involved have never been synced and no sync is running.
    Unknown,
    /// A sync is running and has not yet delivered every table involved.
    Loading,
    /// Every table involved has been delivered by the server at least once.
    Complete,
}

/// The rows of a live query at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    /// Result rows in query order.
    pub rows: Arc<Vec<ResultRow>>,
    /// Completeness of `rows`.
    pub status: QueryStatus,
}

/// Status of a query over `tables`.
pub(crate) fn query_status(
    tables: &BTreeSet<String>,
    delivered: &BTreeSet<String>,
    syncing: bool,
) -> QueryStatus {
    if tables.iter().all(|t| delivered.contains(t)) {
        QueryStatus::Complete
    } else if syncing {
        QueryStatus::Loading
    } else {
        QueryStatus::Unknown
    }
}

struct RelTables {
    all: BTreeSet<String>,
    deeper: BTreeSet<String>,
}

/// One materialized query.
struct View {
    query: ResolvedQuery,
    tables: BTreeSet<String>,
    rel_tables: Vec<RelTables>,
    /// Every matching parent row, expanded, before the window is applied.
    entries: BTreeMap<SortKey, ResultRow>,
    positions: BTreeMap<RowKey, SortKey>,
    published: Arc<Vec<ResultRow>>,
    status: QueryStatus,
    sender: watch::Sender<QuerySnapshot>,
}

impl View {
    fn new(
        query: ResolvedQuery,
        source: &Layered<'_>,
        registry: &SchemaRegistry,
        status: QueryStatus,
    ) -> (Self, watch::Receiver<QuerySnapshot>) {
        let rel_tables = query
            .related()
            .iter()
            .map(|rel| {
                let mut deeper = BTreeSet::new();
                for nested in rel.query.related() {
                    deeper.extend(nested.query.tables());
                }
                RelTables {
                    all: rel.query.tables(),
                    deeper,
                }
            })
            .collect();

        let mut entries = BTreeMap::new();
        let mut positions = BTreeMap::new();
        if let Ok(schema) = registry.table(query.table()) {
            source.for_each_row(query.table(), &mut |row| {
                if !query.matches(row) {
                    return;
                }
                if let Ok(key) = schema.row_key(row) {
                    let sort_key = query.sort_key(row);
                    entries.insert(sort_key.clone(), query.expand(row.clone(), source));
                    positions.insert(key, sort_key);
                }
            });
        }

        let rows: Vec<ResultRow> = query
            .window(entries.iter())
            .map(|(_, row)| row.clone())
            .collect();
        let published = Arc::new(rows);
        let (sender, receiver) = watch::channel(QuerySnapshot {
            rows: Arc::clone(&published),
            status,
        });

        let view = Self {
            tables: query.tables(),
            query,
            rel_tables,
            entries,
            positions,
            published,
            status,
            sender,
        };
        (view, receiver)
    }

    fn apply(&mut self, changes: &Changes, source: &Layered<'_>, registry: &SchemaRegistry) {
        for (table, key) in changes {
            if !self.tables.contains(table) {
                continue;
            }
            if table == self.query.table() {
                self.refresh_parent(key, source);
            }
            for (rel, tables) in self.query.related().iter().zip(&self.rel_tables) {
                if !tables.all.contains(table) {
                    continue;
                }
                if rel.relationship.dest_table == *table && !tables.deeper.contains(table) {
                    let child = source.lookup(table, key);
                    let schema = registry.table(table).ok();
                    for entry in self.entries.values_mut() {
                        let had = entry
                            .related
                            .get(&rel.name)
                            .is_some_and(|related| holds(related, key, schema));
                        let has = child.is_some_and(|c| rel.joins(&entry.row, c));
                        if had || has {
                            entry
                                .related
                                .insert(rel.name.clone(), rel.collect(&entry.row, source));
                        }
                    }
                } else {
                    for entry in self.entries.values_mut() {
                        entry
                            .related
                            .insert(rel.name.clone(), rel.collect(&entry.row, source));
                    }
                }
            }
        }
    }

    fn refresh_parent(&mut self, key: &RowKey, source: &Layered<'_>) {
        if let Some(old) = self.positions.remove(key) {
            self.entries.remove(&old);
        }
        if let Some(row) = source.lookup(self.query.table(), key) {
            if self.query.matches(row) {
                let sort_key = self.query.sort_key(row);
                self.entries
                    .insert(sort_key.clone(), self.query.expand(row.clone(), source));
                self.positions.insert(key.clone(), sort_key);
            }
        }
    }

    /// Publishes the current window if it differs from the last one sent.
    fn publish(&mut self, status: QueryStatus) -> bool {
        let rows: Vec<ResultRow> = self
            .query
            .window(self.entries.iter())
            .map(|(_, row)| row.clone())
            .collect();
        if *self.published == rows && self.status == status {
            return false;
        }
        self.published = Arc::new(rows);
        self.status = status;
        self.sender.send_replace(QuerySnapshot {
            rows: Arc::clone(&self.published),
            status,
        });
        true
    }
}

fn holds(related: &Related, key: &RowKey, schema: Option<&TableSchema>) -> bool {
    let Some(schema) = schema else {
        return true;
    };
    let rows: &[ResultRow] = match related {
        Related::One(Some(row)) => std::slice::from_ref(row.as_ref()),
        Related::One(None) => &[],
        Related::Many(rows) => rows,
    };
    rows.iter()
        .any(|r| schema.row_key(&r.row).is_ok_and(|k| &k == key))
}

/// The registered views of a replica.
#[derive(Default)]
pub(crate) struct Views {
    next_id: u64,
    views: BTreeMap<u64, View>,
}

impl Views {
    pub(crate) fn add(
        &mut self,
        query: ResolvedQuery,
        source: &Layered<'_>,
        registry: &SchemaRegistry,
        delivered: &BTreeSet<String>,
        syncing: bool,
    ) -> (u64, watch::Receiver<QuerySnapshot>) {
        let status = query_status(&query.tables(), delivered, syncing);
        let (view, receiver) = View::new(query, source, registry, status);
        self.next_id += 1;
        self.views.insert(self.next_id, view);
        (self.next_id, receiver)
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.views.remove(&id);
    }

    /// Feeds `changes` through every view and publishes what moved.
    /// Returns the number of views that published.
    pub(crate) fn apply(
        &mut self,
        changes: &Changes,
        source: &Layered<'_>,
        registry: &SchemaRegistry,
        delivered: &BTreeSet<String>,
        syncing: bool,
    ) -> usize {
        let mut published = 0;
        for view in self.views.values_mut() {
            if !changes.is_empty() {
                view.apply(changes, source, registry);
            }
            if view.publish(query_status(&view.tables, delivered, syncing)) {
                published += 1;
            }
        }
        published
    }

    pub(crate) fn clear(&mut self) {
        self.views.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.views.len()
    }
}

struct Registration {
    id: u64,
    replica: Weak<Mutex<Replica>>,
    query: ResolvedQuery,
    receiver: watch::Receiver<QuerySnapshot>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(replica) = self.replica.upgrade() {
            replica.lock().remove_view(self.id);
        }
    }
}

/// A subscription to a live query.
///
/// Clones share one registration; the view is removed from the replica when
/// the last clone is dropped.
#[derive(Clone)]
pub struct LiveQuery {
    inner: Arc<Registration>,
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.inner.id)
            .field("table", &self.inner.query.table())
            .finish_non_exhaustive()
    }
}

impl LiveQuery {
    pub(crate) fn new(
        id: u64,
        replica: &Arc<Mutex<Replica>>,
        query: ResolvedQuery,
        receiver: watch::Receiver<QuerySnapshot>,
    ) -> Self {
        Self {
            inner: Arc::new(Registration {
                id,
                replica: Arc::downgrade(replica),
                query,
                receiver,
            }),
        }
    }

    /// The current rows and status.
    pub fn snapshot(&self) -> QuerySnapshot {
        self.inner.receiver.borrow().clone()
    }

    /// The current rows.
    pub fn rows(&self) -> Arc<Vec<ResultRow>> {
        Arc::clone(&self.inner.receiver.borrow().rows)
    }

    /// The current status.
    pub fn status(&self) -> QueryStatus {
        self.inner.receiver.borrow().status
    }

    /// A receiver that is notified on every published change.
    ///
    /// The channel closes when the client is torn down.
    pub fn subscribe(&self) -> watch::Receiver<QuerySnapshot> {
        self.inner.receiver.clone()
    }

    /// The cursor that resumes this query after `row`.
    pub fn cursor_after(&self, row: &ResultRow) -> Cursor {
        self.inner.query.cursor(&row.row)
    }
}
