//! The application-facing client.

use crate::cache::{CacheStore, MemoryCacheStore, Replica};
use crate::config::ClientConfig;
use crate::dispatch::MutationHandle;
use crate::error::ClientResult;
use crate::live::LiveQuery;
use crate::state::{ConnectionState, SyncCycleResult, SyncEngine, SyncStats};
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use rowsync_core::query::ResultRow;
use rowsync_core::{
    Identity, MutationKind, MutationOp, MutatorRegistry, PermissionSet, Query, Row,
    SchemaRegistry,
};
use std::sync::Arc;
use tracing::{info, warn};

/// The sync engine as used by [`Client`].
pub type ClientEngine = SyncEngine<dyn SyncTransport, Mutex<Replica>>;

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    registry: SchemaRegistry,
    transport: Arc<dyn SyncTransport>,
    permissions: PermissionSet,
    mutators: MutatorRegistry,
    identity: Option<Identity>,
    cache: Arc<dyn CacheStore>,
}

impl ClientBuilder {
    /// Sets the permission rules. They must match the server's so that
    /// optimistic results agree with the authoritative ones.
    pub fn permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    /// Sets the custom mutators.
    pub fn mutators(mut self, mutators: MutatorRegistry) -> Self {
        self.mutators = mutators;
        self
    }

    /// Sets the identity the client acts for.
    pub fn identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    /// Sets where the replica is persisted between runs.
    pub fn cache_store(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    /// Creates the client, restoring the cached replica if there is one.
    pub fn init(self) -> ClientResult<Client> {
        self.mutators.validate(&self.registry)?;

        // A replica that starts empty gets its own id, so the server never
        // treats its mutations as replays of an earlier incarnation's.
        // Restoring a cache brings back the id the pending log was queued under.
        let mut replica = Replica::new(
            format!("{}.{}", self.config.client_id, rowsync_core::new_id()),
            self.registry,
            self.permissions,
            self.mutators,
            self.identity,
        )
        .with_conflict_policy(self.config.conflict_policy);

        match self.cache.load() {
            Ok(Some(state)) => {
                if replica.restore(state) {
                    info!(
                        client_id = %replica.client_id(),
                        pending = replica.pending_count(),
                        "restored cached replica"
                    );
                } else {
                    info!("discarding cache written under another schema or identity");
                    self.cache.clear()?;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "cache unreadable, starting empty");
                self.cache.clear()?;
            }
        }

        let replica = Arc::new(Mutex::new(replica));
        let engine = SyncEngine::new(self.config, self.transport, Arc::clone(&replica));
        Ok(Client {
            replica,
            engine,
            cache: self.cache,
        })
    }
}

/// A rowsync client: a local replica, live queries over it, and the sync
/// engine that keeps it in step with the server.
///
/// Reads and mutations never touch the network. Mutations apply locally at
/// once and are confirmed (or rolled back) by a later [`Client::sync`].
pub struct Client {
    replica: Arc<Mutex<Replica>>,
    engine: ClientEngine,
    cache: Arc<dyn CacheStore>,
}

impl Client {
    /// Starts building a client.
    pub fn builder(
        config: ClientConfig,
        registry: SchemaRegistry,
        transport: Arc<dyn SyncTransport>,
    ) -> ClientBuilder {
        ClientBuilder {
            config,
            registry,
            transport,
            permissions: PermissionSet::open(),
            mutators: MutatorRegistry::new(),
            identity: None,
            cache: Arc::new(MemoryCacheStore::new()),
        }
    }

    /// The client id, as known to the server.
    pub fn client_id(&self) -> String {
        self.replica.lock().client_id().to_string()
    }

    /// The identity the client acts for.
    pub fn identity(&self) -> Option<Identity> {
        self.replica.lock().identity().cloned()
    }

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        self.engine.config()
    }

    /// The connection state.
    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// The sync engine.
    pub fn engine(&self) -> &ClientEngine {
        &self.engine
    }

    /// Number of mutations awaiting server confirmation.
    pub fn pending_count(&self) -> usize {
        self.replica.lock().pending_count()
    }

    /// Subscribes to a live query.
    pub fn query(&self, query: &Query) -> ClientResult<LiveQuery> {
        let (id, resolved, receiver) = self.replica.lock().add_view(query)?;
        Ok(LiveQuery::new(id, &self.replica, resolved, receiver))
    }

    /// Runs a query once against the local replica.
    pub fn run_query(&self, query: &Query) -> ClientResult<Vec<ResultRow>> {
        Ok(self.replica.lock().run_query(query)?)
    }

    /// The visible row with the given primary key.
    pub fn get(&self, table: &str, key: &Row) -> ClientResult<Option<Row>> {
        Ok(self.replica.lock().get(table, key)?)
    }

    /// Applies a mutation locally and queues it for the server.
    pub fn mutate(&self, table: &str, op: MutationOp, payload: Row) -> ClientResult<MutationHandle> {
        let handle = self
            .replica
            .lock()
            .mutate(MutationKind::new(table, op, payload))?;
        self.persist();
        Ok(handle)
    }

    /// Inserts a row unless its key exists.
    pub fn insert(&self, table: &str, row: Row) -> ClientResult<MutationHandle> {
        self.mutate(table, MutationOp::Insert, row)
    }

    /// Creates or replaces a row.
    pub fn upsert(&self, table: &str, row: Row) -> ClientResult<MutationHandle> {
        self.mutate(table, MutationOp::Upsert, row)
    }

    /// Merges the given columns into an existing row.
    pub fn update(&self, table: &str, patch: Row) -> ClientResult<MutationHandle> {
        self.mutate(table, MutationOp::Update, patch)
    }

    /// Deletes a row by primary key.
    pub fn delete(&self, table: &str, key: Row) -> ClientResult<MutationHandle> {
        self.mutate(table, MutationOp::Delete, key)
    }

    /// Runs a custom mutator.
    pub fn call(&self, table: &str, name: &str, args: Row) -> ClientResult<MutationHandle> {
        self.mutate(table, MutationOp::custom(name), args)
    }

    /// Runs one sync cycle.
    pub fn sync(&self) -> ClientResult<SyncCycleResult> {
        let result = self.engine.sync();
        self.persist();
        result
    }

    /// Runs a sync cycle, retrying transient failures.
    pub fn sync_with_retry(&self) -> ClientResult<SyncCycleResult> {
        let result = self.engine.sync_with_retry();
        self.persist();
        result
    }

    /// Discards the replica, the pending log, every live view and the
    /// persisted cache. Use on logout or before switching identity, then
    /// build a new client for the new identity.
    pub fn teardown(self) -> ClientResult<()> {
        self.engine.cancel();
        self.replica.lock().clear();
        self.engine.disconnect();
        self.engine.transport().close()?;
        self.cache.clear()
    }

    fn persist(&self) {
        let state = self.replica.lock().to_state();
        if let Err(e) = self.cache.save(&state) {
            warn!(error = %e, "failed to persist replica");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("replica", &*self.replica.lock())
            .field("state", &self.engine.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileCacheStore;
    use crate::live::QueryStatus;
    use crate::transport::MockTransport;
    use rowsync_core::{ColumnType, TableSchema};
    use rowsync_protocol::{HandshakeResponse, PullResponse, TableDelta};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .table(
                TableSchema::builder("note")
                    .column("id", ColumnType::Text)
                    .column("body", ColumnType::Text)
                    .primary_key(["id"])
                    .build(),
            )
            .build()
            .unwrap()
    }

    fn client(transport: Arc<MockTransport>) -> Client {
        Client::builder(
            ClientConfig::new("client-1", "https://test.example.com"),
            registry(),
            transport,
        )
        .init()
        .unwrap()
    }

    fn note(id: &str, body: &str) -> Row {
        Row::new().with("id", id).with("body", body)
    }

    #[test]
    fn works_offline() {
        let transport = Arc::new(MockTransport::new());
        transport.set_connected(false);
        let client = client(Arc::clone(&transport));

        let live = client.query(&Query::table("note")).unwrap();
        assert_eq!(live.status(), QueryStatus::Unknown);

        client.insert("note", note("n1", "hello")).unwrap();
        assert_eq!(live.rows().len(), 1);
        assert_eq!(client.pending_count(), 1);

        assert!(client.sync().unwrap_err().is_retryable());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.pending_count(), 1);
    }

    #[test]
    fn status_becomes_complete_after_sync() {
        let transport = Arc::new(MockTransport::new());
        transport.set_handshake_response(HandshakeResponse::success("e1", 0, 0));
        transport.push_pull_response(PullResponse::new(
            "e1",
            vec![TableDelta::snapshot("note", vec![], 0)],
            0,
        ));
        let client = client(Arc::clone(&transport));
        let live = client.query(&Query::table("note")).unwrap();

        client.sync().unwrap();
        assert_eq!(live.status(), QueryStatus::Complete);
        assert_eq!(client.state(), ConnectionState::Live);
    }

    #[test]
    fn update_merges_fields() {
        let client = client(Arc::new(MockTransport::new()));
        client.insert("note", note("n1", "draft")).unwrap();
        client
            .update("note", Row::new().with("id", "n1").with("body", "final"))
            .unwrap();
        let row = client.get("note", &Row::new().with("id", "n1")).unwrap();
        assert_eq!(row, Some(note("n1", "final")));
    }

    #[test]
    fn pending_mutations_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn CacheStore> =
            Arc::new(FileCacheStore::new(dir.path().join("replica.cbor")));
        let open = |cache: Arc<dyn CacheStore>| {
            Client::builder(
                ClientConfig::new("client-1", "https://test.example.com"),
                registry(),
                Arc::new(MockTransport::new()),
            )
            .cache_store(cache)
            .init()
            .unwrap()
        };

        let first = open(Arc::clone(&cache));
        first.insert("note", note("n1", "kept")).unwrap();
        drop(first);

        let second = open(Arc::clone(&cache));
        assert_eq!(second.pending_count(), 1);
        assert_eq!(
            second.run_query(&Query::table("note")).unwrap()[0].row,
            note("n1", "kept")
        );

        second.teardown().unwrap();
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn dropping_live_query_removes_view() {
        let client = client(Arc::new(MockTransport::new()));
        let live = client.query(&Query::table("note")).unwrap();
        let copy = live.clone();
        drop(live);
        assert_eq!(client.replica.lock().view_count(), 1);
        drop(copy);
        assert_eq!(client.replica.lock().view_count(), 0);
    }
}
