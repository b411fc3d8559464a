//! Connection state machine and sync engine.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use rowsync_core::Mutation;
use rowsync_protocol::{
    Conflict, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, TableCursor,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection state of a client.
///
/// ```text
/// Disconnected -> Connecting -> Syncing -> Live
///       ^             |            |        |
///       +-------------+------------+--------+   (transport failure)
///                                  ^        |
///                                  +--------+   (next cycle)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No usable connection; local reads and writes still work.
    Disconnected,
    /// Handshaking with the server.
    Connecting,
    /// Pulling and pushing.
    Syncing,
    /// Caught up with the server.
    Live,
}

impl ConnectionState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Syncing)
                | (Live, Syncing)
                | (Syncing, Live)
        )
    }

    /// Returns true while a sync cycle is running.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Syncing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Live => "live",
        };
        f.write_str(name)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of row patches pulled.
    pub rows_pulled: u64,
    /// Total number of mutations pushed.
    pub mutations_pushed: u64,
    /// Total number of mutations the server rejected.
    pub mutations_rejected: u64,
    /// Total number of version conflicts reported.
    pub conflicts_encountered: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// What a pushed batch did.
#[derive(Debug, Clone, Default)]
pub struct PushSummary {
    /// Mutations applied (or already processed) by the server.
    pub applied: usize,
    /// Mutations the server rejected.
    pub rejected: usize,
    /// Version conflicts among the rejections.
    pub conflicts: Vec<Conflict>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Number of row patches pulled.
    pub pulled: u64,
    /// Number of mutations pushed.
    pub pushed: u64,
    /// Number of pushed mutations the server rejected.
    pub rejected: u64,
    /// Version conflicts reported by the server.
    pub conflicts: Vec<Conflict>,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

/// The replica side of a sync cycle.
pub trait SyncApplier: Send + Sync {
    /// Client id the server tracks mutations under.
    fn client_id(&self) -> String;

    /// Version of the local schema.
    fn schema_version(&self) -> String;

    /// Server epoch the local cursors belong to.
    fn epoch(&self) -> Option<String>;

    /// Cursor of every table to pull.
    fn table_cursors(&self) -> Vec<TableCursor>;

    /// Marks a sync as running or finished.
    fn set_syncing(&self, syncing: bool);

    /// Records the handshake result.
    fn apply_handshake(&self, response: &HandshakeResponse) -> ClientResult<()>;

    /// Applies one pull page, returning the number of row patches.
    fn apply_pull(&self, response: PullResponse) -> ClientResult<usize>;

    /// The oldest `limit` pending mutations.
    fn pending_batch(&self, limit: usize) -> Vec<Mutation>;

    /// Applies the server's verdict on a pushed batch.
    fn apply_push(&self, response: PushResponse) -> ClientResult<PushSummary>;
}

/// Drives sync cycles between a transport and a replica.
///
/// A cycle is handshake, then pull until every table is caught up, then push
/// until nothing is pending. Pulling first means the server's view of rows
/// is current before local mutations are sent against it.
pub struct SyncEngine<T: SyncTransport + ?Sized, A: SyncApplier + ?Sized> {
    config: ClientConfig,
    transport: Arc<T>,
    applier: Arc<A>,
    state: RwLock<ConnectionState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
    current_retry: AtomicU64,
}

impl<T: SyncTransport + ?Sized, A: SyncApplier + ?Sized> SyncEngine<T, A> {
    /// Creates a new sync engine.
    pub fn new(config: ClientConfig, transport: Arc<T>, applier: Arc<A>) -> Self {
        Self {
            config,
            transport,
            applier,
            state: RwLock::new(ConnectionState::Disconnected),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
            current_retry: AtomicU64::new(0),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Attempt number of the running `sync_with_retry` (0 for the first).
    pub fn current_retry(&self) -> u64 {
        self.current_retry.load(Ordering::SeqCst)
    }

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Cancels any ongoing sync operation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> ClientResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(ClientError::transport_fatal("sync cancelled"))
        } else {
            Ok(())
        }
    }

    /// Moves to `next`, failing if the state machine does not allow it.
    pub fn transition(&self, next: ConnectionState) -> ClientResult<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(ClientError::InvalidStateTransition {
                from: state.to_string(),
                to: next.to_string(),
            });
        }
        let from = *state;
        if from != next {
            debug!(from = %from, to = %next, "connection state");
        }
        *state = next;
        Ok(())
    }

    /// Marks the connection as lost.
    pub fn disconnect(&self) {
        *self.state.write() = ConnectionState::Disconnected;
    }

    /// Performs a full sync cycle.
    pub fn sync(&self) -> ClientResult<SyncCycleResult> {
        let start = Instant::now();
        self.reset_cancel();

        let first = match self.state() {
            ConnectionState::Live => ConnectionState::Syncing,
            _ => ConnectionState::Connecting,
        };
        self.transition(first)?;
        self.applier.set_syncing(true);

        let outcome = self.run_cycle();
        self.applier.set_syncing(false);

        match outcome {
            Ok(mut result) => {
                result.duration = start.elapsed();
                self.transition(ConnectionState::Live)?;
                self.current_retry.store(0, Ordering::SeqCst);

                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.rows_pulled += result.pulled;
                stats.mutations_pushed += result.pushed;
                stats.mutations_rejected += result.rejected;
                stats.conflicts_encountered += result.conflicts.len() as u64;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                debug!(
                    pulled = result.pulled,
                    pushed = result.pushed,
                    rejected = result.rejected,
                    elapsed_ms = result.duration.as_millis() as u64,
                    "sync cycle complete"
                );
                Ok(result)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    fn run_cycle(&self) -> ClientResult<SyncCycleResult> {
        if self.state() == ConnectionState::Connecting {
            self.handshake()?;
            self.transition(ConnectionState::Syncing)?;
        }
        self.check_cancelled()?;

        let pulled = self.pull_all()?;
        self.check_cancelled()?;

        let (pushed, summary) = self.push_all()?;
        Ok(SyncCycleResult {
            pulled,
            pushed,
            rejected: summary.rejected as u64,
            conflicts: summary.conflicts,
            duration: Duration::ZERO,
        })
    }

    /// Performs a sync with retry on transient errors.
    pub fn sync_with_retry(&self) -> ClientResult<SyncCycleResult> {
        let retry_config = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry_config.max_attempts {
            if attempt > 0 {
                let delay = retry_config.delay_for_attempt(attempt);
                std::thread::sleep(delay);
                self.stats.write().retries += 1;
            }

            self.check_cancelled()?;
            self.current_retry
                .store(u64::from(attempt), Ordering::SeqCst);

            match self.sync() {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if e.is_retryable() && attempt + 1 < retry_config.max_attempts {
                        debug!(attempt, error = %e, "sync failed, retrying");
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ClientError::Protocol("no sync attempts made".into())))
    }

    fn handshake(&self) -> ClientResult<()> {
        let request = HandshakeRequest::new(self.applier.client_id(), self.applier.schema_version())
            .with_epoch(self.applier.epoch());
        let response = self.transport.handshake(&request)?;

        if !response.success {
            return Err(ClientError::HandshakeRefused(
                response
                    .error
                    .unwrap_or_else(|| "handshake failed".into()),
            ));
        }
        info!(
            epoch = %response.epoch,
            server_cursor = response.server_cursor,
            last_mutation_id = response.last_mutation_id,
            "connected"
        );
        self.applier.apply_handshake(&response)
    }

    /// Pulls until no table has more changes.
    fn pull_all(&self) -> ClientResult<u64> {
        let mut total = 0u64;
        loop {
            self.check_cancelled()?;
            let request = PullRequest::new(
                self.applier.client_id(),
                self.applier.table_cursors(),
                self.config.pull_batch_size,
            )
            .with_epoch(self.applier.epoch());

            let response = self.transport.pull(&request)?;
            let has_more = response.has_more();
            total += self.applier.apply_pull(response)? as u64;
            if !has_more {
                break;
            }
        }
        Ok(total)
    }

    /// Pushes pending mutations in batches until none are left.
    fn push_all(&self) -> ClientResult<(u64, PushSummary)> {
        let mut total = 0u64;
        let mut summary = PushSummary::default();
        let limit = usize::try_from(self.config.push_batch_size).unwrap_or(usize::MAX);

        loop {
            self.check_cancelled()?;
            let batch = self.applier.pending_batch(limit);
            let Some(last_id) = batch.last().map(|m| m.id) else {
                break;
            };
            let count = batch.len() as u64;

            let request = PushRequest::new(self.applier.client_id(), batch)
                .with_policy(self.config.conflict_policy);
            let response = self.transport.push(&request)?;
            let progressed = response.last_mutation_id >= last_id;

            let batch_summary = self.applier.apply_push(response)?;
            total += count;
            summary.applied += batch_summary.applied;
            summary.rejected += batch_summary.rejected;
            summary.conflicts.extend(batch_summary.conflicts);

            if !progressed {
                warn!(last_id, "server did not acknowledge the whole batch");
                break;
            }
        }
        Ok((total, summary))
    }

    fn handle_error(&self, error: &ClientError) {
        warn!(error = %error, "sync failed");
        self.disconnect();
        self.stats.write().last_error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Replica;
    use crate::transport::MockTransport;
    use parking_lot::Mutex;
    use rowsync_core::{
        ColumnType, Identity, MutationKind, MutationOp, MutatorRegistry, PermissionSet, Row,
        RowKey, SchemaRegistry, TableSchema,
    };
    use rowsync_protocol::{MutationOutcome, RowPatch, TableDelta};

    fn replica() -> Arc<Mutex<Replica>> {
        let registry = SchemaRegistry::builder()
            .table(
                TableSchema::builder("note")
                    .column("id", ColumnType::Text)
                    .column("body", ColumnType::Text)
                    .primary_key(["id"])
                    .build(),
            )
            .build()
            .unwrap();
        Arc::new(Mutex::new(Replica::new(
            "client-1",
            registry,
            PermissionSet::open(),
            MutatorRegistry::new(),
            Some(Identity::new("u1")),
        )))
    }

    fn engine(
        transport: &Arc<MockTransport>,
        replica: &Arc<Mutex<Replica>>,
    ) -> SyncEngine<MockTransport, Mutex<Replica>> {
        SyncEngine::new(
            ClientConfig::new("client-1", "https://test.example.com"),
            Arc::clone(transport),
            Arc::clone(replica),
        )
    }

    fn note(id: &str) -> Row {
        Row::new().with("id", id).with("body", "hi")
    }

    #[test]
    fn state_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Live));
        assert!(Live.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Live));
        assert!(!Disconnected.can_transition_to(Syncing));
        assert!(!Connecting.can_transition_to(Live));
        assert!(!Syncing.can_transition_to(Connecting));

        assert!(Syncing.is_active());
        assert!(!Live.is_active());
    }

    #[test]
    fn initial_state() {
        let engine = engine(&Arc::new(MockTransport::new()), &replica());
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(engine.stats().cycles_completed, 0);
        assert!(engine.transition(ConnectionState::Live).is_err());
    }

    #[test]
    fn successful_sync_goes_live() {
        let transport = Arc::new(MockTransport::new());
        let replica = replica();
        transport.set_handshake_response(HandshakeResponse::success("e1", 1, 0));
        transport.push_pull_response(PullResponse::new(
            "e1",
            vec![TableDelta::snapshot(
                "note",
                vec![RowPatch::Put {
                    key: RowKey::single("n1"),
                    row: note("n1"),
                    version: 1,
                }],
                1,
            )],
            0,
        ));

        let engine = engine(&transport, &replica);
        let result = engine.sync().unwrap();
        assert_eq!(result.pulled, 1);
        assert_eq!(result.pushed, 0);
        assert_eq!(engine.state(), ConnectionState::Live);
        assert_eq!(engine.stats().cycles_completed, 1);
        assert_eq!(replica.lock().cursor("note"), Some(1));

        // The next cycle starts from Live and skips the handshake.
        transport.set_handshake_response(HandshakeResponse::error("should not be used"));
        engine.sync().unwrap();
        assert_eq!(engine.state(), ConnectionState::Live);
    }

    #[test]
    fn paged_pull_and_push() {
        let transport = Arc::new(MockTransport::new());
        let replica = replica();
        transport.set_handshake_response(HandshakeResponse::success("e1", 2, 0));
        let page = |id: &str, cursor, has_more| {
            PullResponse::new(
                "e1",
                vec![TableDelta::delta(
                    "note",
                    vec![RowPatch::Put {
                        key: RowKey::single(id),
                        row: note(id),
                        version: cursor,
                    }],
                    cursor,
                    has_more,
                )],
                0,
            )
        };
        transport.push_pull_response(page("n1", 1, true));
        transport.push_pull_response(page("n2", 2, false));
        transport.set_push_response(PushResponse::new(
            vec![MutationOutcome::applied(1), MutationOutcome::applied(2)],
            2,
        ));

        for id in ["n3", "n4"] {
            replica
                .lock()
                .mutate(MutationKind::new("note", MutationOp::Insert, note(id)))
                .unwrap();
        }

        let engine = engine(&transport, &replica);
        let result = engine.sync().unwrap();
        assert_eq!(result.pulled, 2);
        assert_eq!(result.pushed, 2);
        assert_eq!(replica.lock().pending_count(), 0);

        let pushed = transport.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].client_id, "client-1");
        assert_eq!(pushed[0].mutations.len(), 2);
    }

    #[test]
    fn refused_handshake_disconnects() {
        let transport = Arc::new(MockTransport::new());
        transport.set_handshake_response(HandshakeResponse::error("schema mismatch"));
        let engine = engine(&transport, &replica());

        let err = engine.sync().unwrap_err();
        assert!(matches!(err, ClientError::HandshakeRefused(_)));
        assert!(!err.is_retryable());
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(engine.stats().last_error.is_some());
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let transport = Arc::new(MockTransport::new());
        transport.set_connected(false);
        let replica = replica();
        let engine = SyncEngine::new(
            ClientConfig::new("client-1", "https://test.example.com").with_retry(
                crate::config::RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .without_jitter(),
            ),
            Arc::clone(&transport),
            Arc::clone(&replica),
        );

        let err = engine.sync_with_retry().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.stats().retries, 2);
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(!replica.lock().is_delivered("note"));
    }
}
