//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::{Execution, Store};
use crate::tasks::TaskQueue;
use rowsync_core::{
    Identity, Location, Mutation, MutationKind, MutatorRegistry, PermissionSet, RowKey,
    SchemaRegistry, Transaction,
};
use rowsync_protocol::{
    Conflict, HandshakeRequest, HandshakeResponse, MutationError, MutationOutcome, PullRequest,
    PullResponse, PushRequest, PushResponse, TablePatch, PROTOCOL_VERSION,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Context for request handling.
#[derive(Debug)]
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Row store (shared across all handlers).
    pub store: Arc<Store>,
    /// Schema declarations.
    pub registry: SchemaRegistry,
    /// Row-level rules.
    pub permissions: PermissionSet,
    /// Custom mutators, including server-only overrides.
    pub mutators: MutatorRegistry,
    /// Post-commit side-task worker.
    pub tasks: TaskQueue,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(
        config: ServerConfig,
        registry: SchemaRegistry,
        permissions: PermissionSet,
        mutators: MutatorRegistry,
    ) -> ServerResult<Self> {
        mutators.validate(&registry)?;
        let store = Arc::new(Store::new(config.change_log_retention));
        let tasks = TaskQueue::start(config.task_queue_capacity)?;
        Ok(Self {
            config,
            store,
            registry,
            permissions,
            mutators,
            tasks,
        })
    }
}

/// Handler for sync requests.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// The shared context.
    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    /// Handles a handshake request.
    pub fn handle_handshake(&self, request: HandshakeRequest) -> ServerResult<HandshakeResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Ok(HandshakeResponse::error(format!(
                "unsupported protocol version: {}",
                request.protocol_version
            )));
        }
        let schema_version = self.context.registry.version();
        if request.schema_version != schema_version {
            return Ok(HandshakeResponse::error(format!(
                "schema version mismatch: client {}, server {}",
                request.schema_version, schema_version
            )));
        }

        let store = &self.context.store;
        let last_mutation_id = store.last_mutation_id(&request.client_id);
        info!(
            client_id = %request.client_id,
            last_mutation_id,
            "client connected"
        );
        Ok(HandshakeResponse::success(
            store.epoch(),
            store.head(),
            last_mutation_id,
        ))
    }

    /// Handles a pull request.
    pub fn handle_pull(
        &self,
        request: PullRequest,
        identity: Option<&Identity>,
    ) -> ServerResult<PullResponse> {
        let ctx = &self.context;
        let limit = request.limit.clamp(1, ctx.config.max_pull_batch.max(1)) as usize;

        let mut tables = Vec::with_capacity(request.tables.len());
        for table_cursor in &request.tables {
            if !ctx.registry.has_table(&table_cursor.table) {
                return Err(ServerError::InvalidRequest(format!(
                    "unknown table: {}",
                    table_cursor.table
                )));
            }
            let filter = ctx.permissions.read_filter(&table_cursor.table, identity);
            let delta = ctx.store.pull_table(
                &table_cursor.table,
                table_cursor.cursor,
                request.epoch.as_deref(),
                limit,
                &filter,
                identity,
            );
            debug!(
                table = %delta.table,
                reset = delta.reset,
                patches = delta.patches.len(),
                cursor = delta.cursor,
                "pull"
            );
            tables.push(delta);
        }

        Ok(PullResponse::new(
            ctx.store.epoch(),
            tables,
            ctx.store.last_mutation_id(&request.client_id),
        ))
    }

    /// Handles a push request.
    ///
    /// Mutations run one by one in submission order, each in its own store
    /// transaction. A rejected mutation does not stop the batch.
    pub fn handle_push(
        &self,
        request: PushRequest,
        identity: Option<&Identity>,
    ) -> ServerResult<PushResponse> {
        let ctx = &self.context;
        if request.mutations.len() > ctx.config.max_push_batch as usize {
            return Err(ServerError::InvalidRequest(format!(
                "too many mutations: {} > {}",
                request.mutations.len(),
                ctx.config.max_push_batch
            )));
        }

        let check_versions = request.policy.checks_versions();
        let mut outcomes = Vec::with_capacity(request.mutations.len());
        let mut conflicts = Vec::new();
        let mut touched = BTreeSet::new();

        for mutation in &request.mutations {
            let execution = ctx.store.execute(&request.client_id, mutation.id, |store| {
                let mut tx = Transaction::new(
                    store,
                    &ctx.registry,
                    &ctx.permissions,
                    identity,
                    Location::Server,
                )
                .with_version_checks(check_versions);
                mutation.execute(&mut tx, &ctx.mutators)?;
                Ok(tx.finish())
            });

            match execution {
                Execution::Duplicate => {
                    outcomes.push(MutationOutcome::already_processed(mutation.id));
                }
                Execution::Committed((keys, deferred)) => {
                    debug!(id = mutation.id, mutation = %mutation.kind, rows = keys.len(), "applied");
                    touched.extend(keys);
                    for task in deferred {
                        ctx.tasks.enqueue(task);
                    }
                    outcomes.push(MutationOutcome::applied(mutation.id));
                }
                Execution::Failed(err) => {
                    warn!(
                        client_id = %request.client_id,
                        id = mutation.id,
                        mutation = %mutation.kind,
                        error = %err,
                        "mutation rejected"
                    );
                    if let Some(conflict) = Conflict::from_error(&err) {
                        conflicts.push(conflict);
                    }
                    if let Some(target) = self.target_key(mutation) {
                        touched.insert(target);
                    }
                    outcomes.push(MutationOutcome::rejected(
                        mutation.id,
                        MutationError::from(err),
                    ));
                }
            }
        }

        let mut response = PushResponse::new(
            outcomes,
            ctx.store.last_mutation_id(&request.client_id),
        );
        response.conflicts = conflicts;
        response.rows = touched
            .into_iter()
            .map(|(table, key)| {
                let filter = ctx.permissions.read_filter(&table, identity);
                let patch = ctx.store.row_patch(&table, &key, &filter, identity);
                TablePatch { table, patch }
            })
            .collect();
        Ok(response)
    }

    /// Row a built-in mutation aimed at, so a rejected client can be sent
    /// its authoritative state.
    fn target_key(&self, mutation: &Mutation) -> Option<(String, RowKey)> {
        let MutationKind::Crud(op) = &mutation.kind else {
            return None;
        };
        let schema = self.context.registry.table(op.table()).ok()?;
        let key = schema.row_key(op.payload()).ok()?;
        Some((op.table().to_string(), key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{
        col, ColumnType, CoreResult, IdentityField, MutationOp, Policy, Row, TablePermissions,
        TableSchema,
    };
    use rowsync_protocol::{ConflictPolicy, ErrorKind, Outcome, RowPatch, TableCursor};

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

    fn create_handler(mutators: MutatorRegistry) -> RequestHandler {
        let registry = registry();
        let owner = Policy::Allow(col("blockerId").eq_identity(IdentityField::Id));
        let permissions = PermissionSet::builder()
            .table(
                "block",
                TablePermissions::new()
                    .select(owner.clone())
                    .insert(owner.clone())
                    .update(owner.clone())
                    .delete(owner),
            )
            .build(&registry)
            .unwrap();
        let context =
            HandlerContext::new(ServerConfig::default(), registry, permissions, mutators).unwrap();
        RequestHandler::new(Arc::new(context))
    }

    fn insert(id: u64, block: &str, blocker: &str) -> Mutation {
        Mutation::new(
            id,
            MutationKind::new(
                "block",
                MutationOp::Insert,
                Row::new().with("id", block).with("blockerId", blocker),
            ),
        )
    }

    fn delete(id: u64, block: &str) -> Mutation {
        Mutation::new(
            id,
            MutationKind::new("block", MutationOp::Delete, Row::new().with("id", block)),
        )
    }

    #[test]
    fn handshake_checks_versions() {
        let handler = create_handler(MutatorRegistry::new());
        let schema = handler.context().registry.version().to_string();

        let ok = handler
            .handle_handshake(HandshakeRequest::new("c1", schema.clone()))
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.epoch, handler.context().store.epoch());

        let stale = handler
            .handle_handshake(HandshakeRequest::new("c1", "0000"))
            .unwrap();
        assert!(!stale.success);

        let mut future = HandshakeRequest::new("c1", schema);
        future.protocol_version = 99;
        assert!(!handler.handle_handshake(future).unwrap().success);
    }

    #[test]
    fn push_applies_dedupes_and_rejects() {
        let handler = create_handler(MutatorRegistry::new());
        let a = Identity::new("A");

        let request = PushRequest::new(
            "c1",
            vec![insert(1, "b1", "A"), insert(2, "b2", "B"), delete(3, "b1")],
        );
        let response = handler.handle_push(request.clone(), Some(&a)).unwrap();
        assert_eq!(response.last_mutation_id, 3);
        assert_eq!(response.outcomes[0].outcome, Outcome::Applied);
        assert_eq!(
            response.outcomes[1].error().map(|e| e.kind),
            Some(ErrorKind::PermissionDenied)
        );
        assert_eq!(response.outcomes[2].outcome, Outcome::Applied);
        assert_eq!(handler.context().store.row_count("block"), 0);
        assert!(response
            .rows
            .iter()
            .all(|r| matches!(r.patch, RowPatch::Delete { .. })));

        let retry = handler.handle_push(request, Some(&a)).unwrap();
        assert!(retry
            .outcomes
            .iter()
            .all(|o| o.outcome == Outcome::AlreadyProcessed));
        assert_eq!(handler.context().store.row_count("block"), 0);
    }

    #[test]
    fn anonymous_builtin_write_is_not_authenticated() {
        let handler = create_handler(MutatorRegistry::new());
        let response = handler
            .handle_push(PushRequest::new("c1", vec![insert(1, "b1", "A")]), None)
            .unwrap();
        assert_eq!(
            response.outcomes[0].error().map(|e| e.kind),
            Some(ErrorKind::NotAuthenticated)
        );
        assert_eq!(handler.context().store.row_count("block"), 0);
    }

    #[test]
    fn push_batch_limit() {
        let handler = create_handler(MutatorRegistry::new());
        let mutations = (1..=101).map(|i| delete(i, "x")).collect();
        let err = handler
            .handle_push(PushRequest::new("c1", mutations), None)
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn reject_stale_reports_conflict() {
        let handler = create_handler(MutatorRegistry::new());
        let a = Identity::new("A");
        handler
            .handle_push(PushRequest::new("c1", vec![insert(1, "b1", "A")]), Some(&a))
            .unwrap();

        let mut kind = MutationKind::new(
            "block",
            MutationOp::Update,
            Row::new().with("id", "b1").with("reason", "spam"),
        );
        if let MutationKind::Crud(op) = &mut kind {
            op.set_expected_version(7);
        }
        let response = handler
            .handle_push(
                PushRequest::new("c2", vec![Mutation::new(1, kind)])
                    .with_policy(ConflictPolicy::RejectStale),
                Some(&a),
            )
            .unwrap();
        assert_eq!(response.conflicts.len(), 1);
        assert_eq!(response.conflicts[0].actual_version, 1);
        assert_eq!(
            response.outcomes[0].error().map(|e| e.kind),
            Some(ErrorKind::Conflict)
        );
        // The authoritative row comes back so the client can roll back.
        assert!(matches!(
            &response.rows[0].patch,
            RowPatch::Put { version: 1, .. }
        ));
    }

    #[test]
    fn custom_mutator_runs_deferred_tasks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static SENT: AtomicUsize = AtomicUsize::new(0);

        fn block_user(tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()> {
            let me = tx.identity()?.id.clone();
            let id = args.text("id")?.to_string();
            tx.insert("block", Row::new().with("id", id).with("blockerId", me))?;
            tx.defer("notify", || {
                SENT.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        }

        let handler = create_handler(MutatorRegistry::new().register("block", "blockUser", block_user));
        let mutation = Mutation::new(
            1,
            MutationKind::new("block", MutationOp::custom("blockUser"), Row::new().with("id", "b7")),
        );
        let response = handler
            .handle_push(PushRequest::new("c1", vec![mutation]), Some(&Identity::new("A")))
            .unwrap();
        assert!(response.outcomes[0].is_success());
        handler.context().tasks.flush();
        assert_eq!(SENT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pull_applies_read_filter_and_rejects_unknown_tables() {
        let handler = create_handler(MutatorRegistry::new());
        let a = Identity::new("A");
        let b = Identity::new("B");
        handler
            .handle_push(PushRequest::new("ca", vec![insert(1, "b1", "A")]), Some(&a))
            .unwrap();
        handler
            .handle_push(PushRequest::new("cb", vec![insert(1, "b2", "B")]), Some(&b))
            .unwrap();

        let pull = PullRequest::new("ca", vec![TableCursor::new("block", None)], 100);
        let response = handler.handle_pull(pull, Some(&a)).unwrap();
        assert_eq!(response.last_mutation_id, 1);
        assert_eq!(response.tables[0].patches.len(), 1);
        assert_eq!(response.tables[0].patches[0].key(), &RowKey::single("b1"));

        let anonymous = handler
            .handle_pull(
                PullRequest::new("x", vec![TableCursor::new("block", None)], 100),
                None,
            )
            .unwrap();
        assert!(anonymous.tables[0].patches.is_empty());

        let bad = PullRequest::new("ca", vec![TableCursor::new("nope", None)], 100);
        assert!(handler.handle_pull(bad, Some(&a)).is_err());
    }
}
