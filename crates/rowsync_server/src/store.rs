//! Authoritative row store with a change log.
//!
//! Every committed write gets the next global sequence number, which also
//! becomes the row's version. The change log records `(seq, table, key)`
//! so pulls can compute which rows moved since a client's cursor.

use parking_lot::RwLock;
use rowsync_core::{Condition, CoreError, CoreResult, Identity, Row, RowKey, RowSource, TxStore};
use rowsync_protocol::{RowPatch, TableDelta};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

type Tables = BTreeMap<String, BTreeMap<RowKey, StoredRow>>;

#[derive(Debug, Clone)]
struct StoredRow {
    row: Row,
    version: u64,
}

#[derive(Debug, Clone)]
struct ChangeEntry {
    seq: u64,
    table: String,
    key: RowKey,
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: Tables,
    log: VecDeque<ChangeEntry>,
    head: u64,
    /// Highest sequence dropped from the log. Cursors below it can no
    /// longer be served incrementally.
    floor: u64,
    clients: HashMap<String, u64>,
}

impl StoreInner {
    fn commit(&mut self, table: &str, key: RowKey, row: Option<Row>) -> Option<u64> {
        let rows = self.tables.entry(table.to_string()).or_default();
        if row.is_none() && !rows.contains_key(&key) {
            return None;
        }
        self.head += 1;
        let seq = self.head;
        match row {
            Some(row) => {
                rows.insert(key.clone(), StoredRow { row, version: seq });
            }
            None => {
                rows.remove(&key);
            }
        }
        self.log.push_back(ChangeEntry {
            seq,
            table: table.to_string(),
            key,
        });
        Some(seq)
    }

    fn compact(&mut self, retention: usize) {
        while self.log.len() > retention {
            if let Some(entry) = self.log.pop_front() {
                self.floor = entry.seq;
            }
        }
    }
}

/// Result of running a mutation through [`Store::execute`].
#[derive(Debug)]
pub enum Execution<T> {
    /// The mutation id was already processed for this client.
    Duplicate,
    /// The writes were committed.
    Committed(T),
    /// The mutation failed; nothing was written.
    Failed(CoreError),
}

/// The server's row store.
///
/// Transactions are serialized by a write lock. Readers take the read lock
/// and only ever observe committed state.
#[derive(Debug)]
pub struct Store {
    inner: RwLock<StoreInner>,
    epoch: String,
    retention: usize,
}

impl Store {
    /// Creates an empty store with a fresh epoch.
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            epoch: uuid::Uuid::new_v4().to_string(),
            retention,
        }
    }

    /// Identifier of this store instance. Cursors are only meaningful
    /// within one epoch.
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    /// Latest committed sequence number.
    pub fn head(&self) -> u64 {
        self.inner.read().head
    }

    /// Highest mutation id processed for `client_id`.
    pub fn last_mutation_id(&self, client_id: &str) -> u64 {
        self.inner
            .read()
            .clients
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    /// Reads a row and its version.
    pub fn get(&self, table: &str, key: &RowKey) -> Option<(Row, u64)> {
        self.inner
            .read()
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|stored| (stored.row.clone(), stored.version))
    }

    /// All rows of a table in key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .read()
            .tables
            .get(table)
            .map(|rows| rows.values().map(|s| s.row.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .read()
            .tables
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    /// Writes a row outside of any mutation, returning its new version.
    /// Used for seeding and administrative fixes.
    pub fn put_row(&self, table: &str, key: RowKey, row: Row) -> u64 {
        let mut inner = self.inner.write();
        let seq = inner.commit(table, key, Some(row)).unwrap_or(inner.head);
        inner.compact(self.retention);
        seq
    }

    /// Runs one client mutation in a transaction.
    ///
    /// `run` sees a staged view of the store. Its writes are committed if
    /// it returns `Ok` and discarded otherwise. Either way the client's last
    /// processed mutation id advances to `mutation_id`, so a retried push
    /// never re-executes it.
    pub fn execute<T, F>(&self, client_id: &str, mutation_id: u64, run: F) -> Execution<T>
    where
        F: FnOnce(&mut dyn TxStore) -> CoreResult<T>,
    {
        let mut inner = self.inner.write();
        let last = inner.clients.get(client_id).copied().unwrap_or(0);
        if mutation_id <= last {
            debug!(client_id, mutation_id, last, "skipping processed mutation");
            return Execution::Duplicate;
        }

        let (result, writes) = {
            let mut staged = Staged::new(&inner.tables, inner.head + 1);
            let result = run(&mut staged);
            (result, staged.writes)
        };
        inner.clients.insert(client_id.to_string(), mutation_id);

        match result {
            Ok(value) => {
                for ((table, key), row) in writes {
                    inner.commit(&table, key, row);
                }
                inner.compact(self.retention);
                Execution::Committed(value)
            }
            Err(err) => Execution::Failed(err),
        }
    }

    /// The current state of a row as seen by `identity`: a put when the
    /// row exists and passes `filter`, a delete otherwise.
    pub fn row_patch(
        &self,
        table: &str,
        key: &RowKey,
        filter: &Condition,
        identity: Option<&Identity>,
    ) -> RowPatch {
        let inner = self.inner.read();
        current_patch(&inner.tables, table, key, filter, identity)
    }

    /// Changes to `table` since `cursor`, restricted to rows passing
    /// `filter`.
    ///
    /// A missing cursor, one from another epoch, or one older than the
    /// retained change log yields a full snapshot. Otherwise at most
    /// `limit` change-log entries are consumed.
    pub fn pull_table(
        &self,
        table: &str,
        cursor: Option<u64>,
        epoch: Option<&str>,
        limit: usize,
        filter: &Condition,
        identity: Option<&Identity>,
    ) -> TableDelta {
        let inner = self.inner.read();
        let same_epoch = epoch == Some(self.epoch.as_str());
        let cursor = match cursor {
            Some(c) if same_epoch && c >= inner.floor && c <= inner.head => c,
            _ => return snapshot(&inner, table, filter, identity),
        };

        let start = inner.log.partition_point(|e| e.seq <= cursor);
        let mut keys = Vec::new();
        let mut seen = BTreeSet::new();
        let mut consumed = 0;
        let mut next_cursor = inner.head;
        let mut has_more = false;
        for entry in inner.log.iter().skip(start).filter(|e| e.table == table) {
            if consumed == limit {
                has_more = true;
                break;
            }
            consumed += 1;
            next_cursor = entry.seq;
            if seen.insert(entry.key.clone()) {
                keys.push(entry.key.clone());
            }
        }
        if !has_more {
            next_cursor = inner.head;
        }

        let patches = keys
            .iter()
            .map(|key| current_patch(&inner.tables, table, key, filter, identity))
            .collect();
        TableDelta::delta(table, patches, next_cursor, has_more)
    }
}

fn current_patch(
    tables: &Tables,
    table: &str,
    key: &RowKey,
    filter: &Condition,
    identity: Option<&Identity>,
) -> RowPatch {
    match tables.get(table).and_then(|rows| rows.get(key)) {
        Some(stored) if filter.evaluate(&stored.row, identity) => RowPatch::Put {
            key: key.clone(),
            row: stored.row.clone(),
            version: stored.version,
        },
        _ => RowPatch::Delete { key: key.clone() },
    }
}

fn snapshot(
    inner: &StoreInner,
    table: &str,
    filter: &Condition,
    identity: Option<&Identity>,
) -> TableDelta {
    let patches = inner
        .tables
        .get(table)
        .into_iter()
        .flat_map(|rows| rows.iter())
        .filter(|(_, stored)| filter.evaluate(&stored.row, identity))
        .map(|(key, stored)| RowPatch::Put {
            key: key.clone(),
            row: stored.row.clone(),
            version: stored.version,
        })
        .collect();
    TableDelta::snapshot(table, patches, inner.head)
}

/// Uncommitted writes layered over the committed tables.
struct Staged<'a> {
    base: &'a Tables,
    writes: BTreeMap<(String, RowKey), Option<Row>>,
    pending_version: u64,
}

impl<'a> Staged<'a> {
    fn new(base: &'a Tables, pending_version: u64) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
            pending_version,
        }
    }

    fn staged(&self, table: &str, key: &RowKey) -> Option<&Option<Row>> {
        self.writes.get(&(table.to_string(), key.clone()))
    }
}

impl RowSource for Staged<'_> {
    fn for_each_row(&self, table: &str, visit: &mut dyn FnMut(&Row)) {
        if let Some(rows) = self.base.get(table) {
            for (key, stored) in rows {
                if self.staged(table, key).is_none() {
                    visit(&stored.row);
                }
            }
        }
        for (_, row) in self.writes.iter().filter(|((t, _), _)| t.as_str() == table) {
            if let Some(row) = row {
                visit(row);
            }
        }
    }
}

impl TxStore for Staged<'_> {
    fn get(&self, table: &str, key: &RowKey) -> Option<Row> {
        match self.staged(table, key) {
            Some(row) => row.clone(),
            None => self
                .base
                .get(table)
                .and_then(|rows| rows.get(key))
                .map(|s| s.row.clone()),
        }
    }

    fn version(&self, table: &str, key: &RowKey) -> u64 {
        match self.staged(table, key) {
            Some(Some(_)) => self.pending_version,
            Some(None) => 0,
            None => self
                .base
                .get(table)
                .and_then(|rows| rows.get(key))
                .map_or(0, |s| s.version),
        }
    }

    fn put(&mut self, table: &str, key: RowKey, row: Row) {
        self.writes.insert((table.to_string(), key), Some(row));
    }

    fn remove(&mut self, table: &str, key: &RowKey) {
        self.writes.insert((table.to_string(), key.clone()), None);
    }
}
