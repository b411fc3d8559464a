//! The client replica.
//!
//! Three layers make up what the application sees:
//!
//! 1. **Base rows** - the last authoritative state received from the
//!    server, with their versions
//! 2. **Overlay** - the effect of every pending mutation, computed by
//!    re-running those mutations over the base rows
//! 3. **Views** - live queries maintained over base + overlay
//!
//! Server data only ever touches the base; the overlay is rebuilt after
//! every server update so that confirmed mutations disappear from it and
//! rejected ones roll back.

mod store;

pub use store::{CacheState, CacheStore, CachedRow, FileCacheStore, MemoryCacheStore};

use crate::dispatch::{MutationHandle, Waiters};
use crate::error::{ClientError, ClientResult};
use crate::live::{QuerySnapshot, Views};
use crate::state::{PushSummary, SyncApplier};
use parking_lot::Mutex;
use rowsync_core::query::{ResolvedQuery, ResultRow, RowSource};
use rowsync_core::{
    CoreResult, Identity, Location, Mutation, MutationKind, MutatorRegistry, PermissionSet,
    Query, Row, RowKey, SchemaRegistry, Transaction, TxStore,
};
use rowsync_protocol::{
    ConflictPolicy, HandshakeResponse, Outcome, PendingLog, PullResponse, PushResponse,
    RowPatch, TableCursor,
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Rows that changed, by `(table, key)`.
pub(crate) type Changes = BTreeSet<(String, RowKey)>;

#[derive(Debug, Clone)]
struct BaseRow {
    row: Row,
    version: u64,
}

type BaseTables = BTreeMap<String, BTreeMap<RowKey, BaseRow>>;

/// Optimistic state of one row. `row: None` hides a base row.
#[derive(Debug, Clone)]
struct OverlayEntry {
    row: Option<Row>,
    mutations: Vec<u64>,
}

type Overlay = BTreeMap<String, BTreeMap<RowKey, OverlayEntry>>;
type Writes = BTreeMap<String, BTreeMap<RowKey, Option<Row>>>;

/// Base rows seen through the overlay and, while a mutation runs, through
/// its own uncommitted writes.
pub(crate) struct Layered<'a> {
    base: &'a BaseTables,
    overlay: &'a Overlay,
    writes: Writes,
}

impl<'a> Layered<'a> {
    fn new(base: &'a BaseTables, overlay: &'a Overlay) -> Self {
        Self {
            base,
            overlay,
            writes: Writes::new(),
        }
    }

    /// The visible row under `key`.
    pub(crate) fn lookup(&self, table: &str, key: &RowKey) -> Option<&Row> {
        if let Some(write) = self.writes.get(table).and_then(|w| w.get(key)) {
            return write.as_ref();
        }
        if let Some(entry) = self.overlay.get(table).and_then(|o| o.get(key)) {
            return entry.row.as_ref();
        }
        self.base
            .get(table)
            .and_then(|b| b.get(key))
            .map(|b| &b.row)
    }
}

impl RowSource for Layered<'_> {
    fn for_each_row(&self, table: &str, visit: &mut dyn FnMut(&Row)) {
        let writes = self.writes.get(table);
        let overlay = self.overlay.get(table);
        let written = |key: &RowKey| writes.is_some_and(|w| w.contains_key(key));

        for (key, base) in self.base.get(table).into_iter().flatten() {
            if !written(key) && !overlay.is_some_and(|o| o.contains_key(key)) {
                visit(&base.row);
            }
        }
        for (key, entry) in overlay.into_iter().flatten() {
            if let (false, Some(row)) = (written(key), &entry.row) {
                visit(row);
            }
        }
        for row in writes.into_iter().flat_map(|w| w.values()).flatten() {
            visit(row);
        }
    }
}

impl TxStore for Layered<'_> {
    fn get(&self, table: &str, key: &RowKey) -> Option<Row> {
        self.lookup(table, key).cloned()
    }

    fn version(&self, table: &str, key: &RowKey) -> u64 {
        self.base
            .get(table)
            .and_then(|b| b.get(key))
            .map_or(0, |b| b.version)
    }

    fn put(&mut self, table: &str, key: RowKey, row: Row) {
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key, Some(row));
    }

    fn remove(&mut self, table: &str, key: &RowKey) {
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key.clone(), None);
    }
}

/// Declarations shared by every run of a mutation on this client.
struct Context<'a> {
    registry: &'a SchemaRegistry,
    permissions: &'a PermissionSet,
    mutators: &'a MutatorRegistry,
    identity: Option<&'a Identity>,
}

impl Context<'_> {
    /// Runs `mutation` over base + overlay and returns its writes.
    fn run(&self, mutation: &Mutation, base: &BaseTables, overlay: &Overlay) -> CoreResult<Writes> {
        let mut staged = Layered::new(base, overlay);
        {
            let mut tx = Transaction::new(
                &mut staged,
                self.registry,
                self.permissions,
                self.identity,
                Location::Client,
            );
            mutation.execute(&mut tx, self.mutators)?;
        }
        Ok(staged.writes)
    }
}

fn merge(overlay: &mut Overlay, writes: Writes, id: u64, changes: &mut Changes) {
    for (table, rows) in writes {
        let entries = overlay.entry(table.clone()).or_default();
        for (key, row) in rows {
            let entry = entries.entry(key.clone()).or_insert_with(|| OverlayEntry {
                row: None,
                mutations: Vec::new(),
            });
            entry.row = row;
            entry.mutations.push(id);
            changes.insert((table.clone(), key));
        }
    }
}

fn overlay_keys(overlay: &Overlay, changes: &mut Changes) {
    for (table, rows) in overlay {
        for key in rows.keys() {
            changes.insert((table.clone(), key.clone()));
        }
    }
}

/// The local replica of one client for one identity.
pub struct Replica {
    client_id: String,
    registry: SchemaRegistry,
    permissions: PermissionSet,
    mutators: MutatorRegistry,
    identity: Option<Identity>,
    policy: ConflictPolicy,
    base: BaseTables,
    overlay: Overlay,
    pending: PendingLog,
    cursors: BTreeMap<String, u64>,
    epoch: Option<String>,
    delivered: BTreeSet<String>,
    syncing: bool,
    views: Views,
    waiters: Waiters,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("client_id", &self.client_id)
            .field("identity", &self.identity)
            .field("epoch", &self.epoch)
            .field("pending", &self.pending.pending_count())
            .field("views", &self.views.len())
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Creates an empty replica.
    pub fn new(
        client_id: impl Into<String>,
        registry: SchemaRegistry,
        permissions: PermissionSet,
        mutators: MutatorRegistry,
        identity: Option<Identity>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            registry,
            permissions,
            mutators,
            identity,
            policy: ConflictPolicy::default(),
            base: BaseTables::new(),
            overlay: Overlay::new(),
            pending: PendingLog::new(),
            cursors: BTreeMap::new(),
            epoch: None,
            delivered: BTreeSet::new(),
            syncing: false,
            views: Views::default(),
            waiters: Waiters::default(),
        }
    }

    /// Sets the conflict policy; under a version-checking policy local
    /// updates and deletes record the version they were based on.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The identity the replica belongs to.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The schema registry.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The server epoch the cursors belong to.
    pub fn epoch(&self) -> Option<&str> {
        self.epoch.as_deref()
    }

    /// The change-log cursor of `table`.
    pub fn cursor(&self, table: &str) -> Option<u64> {
        self.cursors.get(table).copied()
    }

    /// Number of mutations awaiting server confirmation.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    /// Number of registered live views.
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Returns true once the server has delivered `table` at least once.
    pub fn is_delivered(&self, table: &str) -> bool {
        self.delivered.contains(table)
    }

    fn context(&self) -> Context<'_> {
        Context {
            registry: &self.registry,
            permissions: &self.permissions,
            mutators: &self.mutators,
            identity: self.identity.as_ref(),
        }
    }

    /// The visible row with the given primary key.
    pub fn get(&self, table: &str, key: &Row) -> CoreResult<Option<Row>> {
        let key = self.registry.table(table)?.row_key(key)?;
        Ok(Layered::new(&self.base, &self.overlay)
            .lookup(table, &key)
            .cloned())
    }

    /// Ids of the pending mutations whose optimistic effect covers the row.
    /// Empty when the row shows server state.
    pub fn pending_for(&self, table: &str, key: &Row) -> CoreResult<Vec<u64>> {
        let key = self.registry.table(table)?.row_key(key)?;
        Ok(self
            .overlay
            .get(table)
            .and_then(|o| o.get(&key))
            .map(|entry| entry.mutations.clone())
            .unwrap_or_default())
    }

    /// Runs `query` once over the visible rows.
    pub fn run_query(&self, query: &Query) -> CoreResult<Vec<ResultRow>> {
        let resolved = ResolvedQuery::resolve(
            query,
            &self.registry,
            &self.permissions,
            self.identity.as_ref(),
        )?;
        Ok(resolved.execute(&Layered::new(&self.base, &self.overlay)))
    }

    pub(crate) fn add_view(
        &mut self,
        query: &Query,
    ) -> CoreResult<(u64, ResolvedQuery, watch::Receiver<QuerySnapshot>)> {
        let resolved = ResolvedQuery::resolve(
            query,
            &self.registry,
            &self.permissions,
            self.identity.as_ref(),
        )?;
        let source = Layered::new(&self.base, &self.overlay);
        let (id, receiver) = self.views.add(
            resolved.clone(),
            &source,
            &self.registry,
            &self.delivered,
            self.syncing,
        );
        Ok((id, resolved, receiver))
    }

    pub(crate) fn remove_view(&mut self, id: u64) {
        self.views.remove(id);
    }

    /// Applies a mutation optimistically and queues it for the server.
    ///
    /// A mutation that fails locally is not queued.
    pub fn mutate(&mut self, mut kind: MutationKind) -> CoreResult<MutationHandle> {
        if self.policy.checks_versions() {
            if let MutationKind::Crud(op) = &mut kind {
                let key = self.registry.table(op.table())?.row_key(op.payload())?;
                // A row already rewritten by a pending mutation is compared
                // against that mutation's result, not the base, so only the
                // first write in the chain carries a version.
                let shadowed = self
                    .overlay
                    .get(op.table())
                    .is_some_and(|rows| rows.contains_key(&key));
                if !shadowed {
                    if let Some(base) = self.base.get(op.table()).and_then(|t| t.get(&key)) {
                        op.set_expected_version(base.version);
                    }
                }
            }
        }

        let mutation = Mutation::new(self.pending.next_id(), kind);
        let writes = self.context().run(&mutation, &self.base, &self.overlay)?;

        let id = self.pending.append(mutation.kind);
        let mut changes = Changes::new();
        merge(&mut self.overlay, writes, id, &mut changes);
        debug!(id, changed = changes.len(), "applied mutation locally");
        self.notify(&changes);
        Ok(self.waiters.register(id))
    }

    /// Recomputes the overlay from the pending log.
    fn rebuild_overlay(&mut self, changes: &mut Changes) {
        let context = Context {
            registry: &self.registry,
            permissions: &self.permissions,
            mutators: &self.mutators,
            identity: self.identity.as_ref(),
        };
        let mut overlay = Overlay::new();
        for mutation in self.pending.pending() {
            match context.run(mutation, &self.base, &overlay) {
                Ok(writes) => merge(&mut overlay, writes, mutation.id, &mut Changes::new()),
                Err(err) => debug!(
                    id = mutation.id,
                    error = %err,
                    "pending mutation no longer applies locally"
                ),
            }
        }
        let previous = std::mem::replace(&mut self.overlay, overlay);
        overlay_keys(&previous, changes);
        overlay_keys(&self.overlay, changes);
    }

    fn notify(&mut self, changes: &Changes) {
        let source = Layered::new(&self.base, &self.overlay);
        let published = self.views.apply(
            changes,
            &source,
            &self.registry,
            &self.delivered,
            self.syncing,
        );
        if published > 0 {
            debug!(published, changed = changes.len(), "live views updated");
        }
    }

    fn put_base(&mut self, table: &str, key: RowKey, row: Row, version: u64) {
        self.base
            .entry(table.to_string())
            .or_default()
            .insert(key, BaseRow { row, version });
    }

    fn remove_base(&mut self, table: &str, key: &RowKey) {
        if let Some(rows) = self.base.get_mut(table) {
            rows.remove(key);
        }
    }

    /// The cursor of every declared table, for a pull request.
    pub fn table_cursors(&self) -> Vec<TableCursor> {
        self.registry
            .tables()
            .map(|t| TableCursor::new(t.name.clone(), self.cursors.get(&t.name).copied()))
            .collect()
    }

    /// Marks a sync as running or finished, updating query statuses.
    pub fn set_syncing(&mut self, syncing: bool) {
        if self.syncing != syncing {
            self.syncing = syncing;
            self.notify(&Changes::new());
        }
    }

    /// Records the server epoch. A new epoch invalidates every cursor.
    ///
    /// New mutation ids always start above the last id the server has
    /// processed for this client id, so they are never mistaken for
    /// duplicates.
    pub fn apply_handshake(&mut self, response: &HandshakeResponse) {
        if self.epoch.as_deref() != Some(response.epoch.as_str()) {
            if self.epoch.is_some() {
                info!(
                    old = ?self.epoch,
                    new = %response.epoch,
                    "server epoch changed, resyncing from snapshots"
                );
            }
            self.cursors.clear();
            self.epoch = Some(response.epoch.clone());
        }
        if self.pending.skip_past(response.last_mutation_id) {
            warn!(
                client_id = %self.client_id,
                server_last = response.last_mutation_id,
                next_id = self.pending.next_id(),
                "server has processed ids this replica never issued, skipping ahead"
            );
        }
    }

    /// Applies one page of a pull. Returns the number of row patches.
    pub fn apply_pull(&mut self, response: PullResponse) -> usize {
        let mut changes = Changes::new();
        let mut patched = 0;
        let complete = !response.has_more();

        for delta in response.tables {
            if !self.registry.has_table(&delta.table) {
                warn!(table = %delta.table, "ignoring pull delta for undeclared table");
                continue;
            }
            if delta.reset {
                if let Some(rows) = self.base.remove(&delta.table) {
                    changes.extend(rows.into_keys().map(|k| (delta.table.clone(), k)));
                }
            }
            patched += delta.patches.len();
            for patch in delta.patches {
                match patch {
                    RowPatch::Put { key, row, version } => {
                        changes.insert((delta.table.clone(), key.clone()));
                        self.put_base(&delta.table, key, row, version);
                    }
                    RowPatch::Delete { key } => {
                        self.remove_base(&delta.table, &key);
                        changes.insert((delta.table.clone(), key));
                    }
                }
            }
            self.cursors.insert(delta.table.clone(), delta.cursor);
            if !delta.has_more {
                self.delivered.insert(delta.table);
            }
        }
        self.epoch = Some(response.epoch);

        // Only the last page reflects everything up to `last_mutation_id`.
        if complete {
            for mutation in self.pending.acknowledge_up_to(response.last_mutation_id) {
                self.waiters.resolve(mutation.id, Ok(()));
            }
        }

        self.rebuild_overlay(&mut changes);
        self.notify(&changes);
        patched
    }

    /// The oldest `limit` pending mutations.
    pub fn pending_batch(&self, limit: usize) -> Vec<Mutation> {
        self.pending.pending_batch(limit)
    }

    /// Applies the server's verdict on a pushed batch.
    pub fn apply_push(&mut self, response: PushResponse) -> PushSummary {
        let mut changes = Changes::new();
        let mut summary = PushSummary {
            conflicts: response.conflicts,
            ..PushSummary::default()
        };

        for patch in response.rows {
            match patch.patch {
                RowPatch::Put { key, row, version } => {
                    let current = self
                        .base
                        .get(&patch.table)
                        .and_then(|t| t.get(&key))
                        .map_or(0, |b| b.version);
                    if version >= current {
                        changes.insert((patch.table.clone(), key.clone()));
                        self.put_base(&patch.table, key, row, version);
                    }
                }
                RowPatch::Delete { key } => {
                    self.remove_base(&patch.table, &key);
                    changes.insert((patch.table, key));
                }
            }
        }

        for outcome in response.outcomes {
            match outcome.outcome {
                Outcome::Applied | Outcome::AlreadyProcessed => {
                    summary.applied += 1;
                    self.waiters.resolve(outcome.id, Ok(()));
                }
                Outcome::Rejected(error) => {
                    warn!(id = outcome.id, error = %error, "mutation rejected by server");
                    summary.rejected += 1;
                    self.waiters
                        .resolve(outcome.id, Err(ClientError::Rejected(error)));
                }
            }
        }
        for mutation in self.pending.acknowledge_up_to(response.last_mutation_id) {
            self.waiters.resolve(mutation.id, Ok(()));
        }

        self.rebuild_overlay(&mut changes);
        self.notify(&changes);
        summary
    }

    /// Drops everything: rows, pending mutations, cursors and views.
    /// Unresolved mutation handles fail with [`ClientError::TornDown`].
    pub fn clear(&mut self) {
        info!(
            pending = self.pending.pending_count(),
            waiting = self.waiters.len(),
            views = self.views.len(),
            "tearing down replica"
        );
        self.waiters.fail_all(ClientError::TornDown);
        self.views.clear();
        self.base.clear();
        self.overlay.clear();
        self.pending.clear();
        self.cursors.clear();
        self.epoch = None;
        self.delivered.clear();
        self.syncing = false;
    }

    /// Persistable state.
    pub fn to_state(&self) -> CacheState {
        let rows = self
            .base
            .iter()
            .flat_map(|(table, rows)| {
                rows.iter().map(move |(key, base)| CachedRow {
                    table: table.clone(),
                    key: key.clone(),
                    row: base.row.clone(),
                    version: base.version,
                })
            })
            .collect();
        CacheState {
            schema_version: self.registry.version().to_string(),
            client_id: self.client_id.clone(),
            identity: self.identity.clone(),
            epoch: self.epoch.clone(),
            cursors: self.cursors.clone(),
            delivered: self.delivered.clone(),
            rows,
            pending: self.pending.clone(),
        }
    }

    /// Loads persisted state into an empty replica.
    ///
    /// Returns false, leaving the replica untouched, when the state was
    /// written under a different schema or for a different identity.
    pub fn restore(&mut self, state: CacheState) -> bool {
        if state.schema_version != self.registry.version() || state.identity != self.identity {
            return false;
        }
        self.client_id = state.client_id;
        self.epoch = state.epoch;
        self.cursors = state.cursors;
        self.delivered = state.delivered;
        self.pending = state.pending;
        for cached in state.rows {
            self.put_base(&cached.table, cached.key, cached.row, cached.version);
        }
        // Handles of restored mutations were lost with the previous process.
        let mut changes = Changes::new();
        self.rebuild_overlay(&mut changes);
        self.notify(&changes);
        true
    }
}

impl SyncApplier for Mutex<Replica> {
    fn client_id(&self) -> String {
        self.lock().client_id.clone()
    }

    fn schema_version(&self) -> String {
        self.lock().registry.version().to_string()
    }

    fn epoch(&self) -> Option<String> {
        self.lock().epoch.clone()
    }

    fn table_cursors(&self) -> Vec<TableCursor> {
        self.lock().table_cursors()
    }

    fn set_syncing(&self, syncing: bool) {
        self.lock().set_syncing(syncing);
    }

    fn apply_handshake(&self, response: &HandshakeResponse) -> ClientResult<()> {
        self.lock().apply_handshake(response);
        Ok(())
    }

    fn apply_pull(&self, response: PullResponse) -> ClientResult<usize> {
        Ok(self.lock().apply_pull(response))
    }

    fn pending_batch(&self, limit: usize) -> Vec<Mutation> {
        self.lock().pending_batch(limit)
    }

    fn apply_push(&self, response: PushResponse) -> ClientResult<PushSummary> {
        Ok(self.lock().apply_push(response))
    }
}
