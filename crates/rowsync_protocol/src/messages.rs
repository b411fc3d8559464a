//! Protocol messages for sync.

use crate::codec::wire_message;
use crate::conflict::{Conflict, ConflictPolicy};
use crate::outcome::MutationOutcome;
use rowsync_core::{Mutation, Row, RowKey};
use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMessage {
    /// Handshake request.
    HandshakeRequest(HandshakeRequest),
    /// Handshake response.
    HandshakeResponse(HandshakeResponse),
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Push request.
    PushRequest(PushRequest),
    /// Push response.
    PushResponse(PushResponse),
    /// Error reply.
    Error(ErrorResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::HandshakeRequest(_) => 1,
            SyncMessage::HandshakeResponse(_) => 2,
            SyncMessage::PullRequest(_) => 3,
            SyncMessage::PullResponse(_) => 4,
            SyncMessage::PushRequest(_) => 5,
            SyncMessage::PushResponse(_) => 6,
            SyncMessage::Error(_) => 7,
        }
    }
}

/// Handshake request from client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client id, stable across restarts of the same cache.
    pub client_id: String,
    /// Protocol version.
    pub protocol_version: u16,
    /// Fingerprint of the client's schema declarations.
    pub schema_version: String,
    /// Server epoch the client's cache was built against.
    pub epoch: Option<String>,
}

impl HandshakeRequest {
    /// Creates a new handshake request.
    pub fn new(client_id: impl Into<String>, schema_version: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            protocol_version: PROTOCOL_VERSION,
            schema_version: schema_version.into(),
            epoch: None,
        }
    }

    /// Sets the known epoch.
    pub fn with_epoch(mut self, epoch: Option<String>) -> Self {
        self.epoch = epoch;
        self
    }
}

/// Handshake response from server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether handshake succeeded.
    pub success: bool,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server's protocol version.
    pub protocol_version: u16,
    /// Server's store epoch. Changes when the store is recreated, which
    /// invalidates every cursor a client holds.
    pub epoch: String,
    /// Server's current change-log position.
    pub server_cursor: u64,
    /// Highest mutation id of this client the server has processed.
    pub last_mutation_id: u64,
}

impl HandshakeResponse {
    /// Creates a successful handshake response.
    pub fn success(epoch: impl Into<String>, server_cursor: u64, last_mutation_id: u64) -> Self {
        Self {
            success: true,
            error: None,
            protocol_version: PROTOCOL_VERSION,
            epoch: epoch.into(),
            server_cursor,
            last_mutation_id,
        }
    }

    /// Creates a failed handshake response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            protocol_version: PROTOCOL_VERSION,
            epoch: String::new(),
            server_cursor: 0,
            last_mutation_id: 0,
        }
    }
}

/// Per-table pull position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCursor {
    /// Table name.
    pub table: String,
    /// Change-log position already applied, or `None` for a first pull.
    pub cursor: Option<u64>,
}

impl TableCursor {
    /// Creates a table cursor.
    pub fn new(table: impl Into<String>, cursor: Option<u64>) -> Self {
        Self {
            table: table.into(),
            cursor,
        }
    }
}

/// Pull request from client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Client id.
    pub client_id: String,
    /// Epoch the cursors belong to.
    pub epoch: Option<String>,
    /// Tables to pull and where to resume each.
    pub tables: Vec<TableCursor>,
    /// Maximum number of change-log entries per table.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a new pull request.
    pub fn new(client_id: impl Into<String>, tables: Vec<TableCursor>, limit: u32) -> Self {
        Self {
            client_id: client_id.into(),
            epoch: None,
            tables,
            limit,
        }
    }

    /// Sets the epoch.
    pub fn with_epoch(mut self, epoch: Option<String>) -> Self {
        self.epoch = epoch;
        self
    }
}

/// A change to one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowPatch {
    /// The row's current authoritative content.
    Put {
        /// Row key.
        key: RowKey,
        /// Full row.
        row: Row,
        /// Row version.
        version: u64,
    },
    /// The row is gone or no longer visible to the client.
    Delete {
        /// Row key.
        key: RowKey,
    },
}

impl RowPatch {
    /// The row key.
    pub fn key(&self) -> &RowKey {
        match self {
            RowPatch::Put { key, .. } | RowPatch::Delete { key } => key,
        }
    }
}

/// Changes to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDelta {
    /// Table name.
    pub table: String,
    /// When true, `patches` is a full snapshot replacing the cached table.
    pub reset: bool,
    /// Row changes, in change-log order.
    pub patches: Vec<RowPatch>,
    /// Position to resume from next time.
    pub cursor: u64,
    /// True if more changes are waiting past `cursor`.
    pub has_more: bool,
}

impl TableDelta {
    /// A full snapshot.
    pub fn snapshot(table: impl Into<String>, patches: Vec<RowPatch>, cursor: u64) -> Self {
        Self {
            table: table.into(),
            reset: true,
            patches,
            cursor,
            has_more: false,
        }
    }

    /// An incremental delta.
    pub fn delta(
        table: impl Into<String>,
        patches: Vec<RowPatch>,
        cursor: u64,
        has_more: bool,
    ) -> Self {
        Self {
            table: table.into(),
            reset: false,
            patches,
            cursor,
            has_more,
        }
    }
}

/// Pull response from server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Server epoch.
    pub epoch: String,
    /// Per-table changes, in request order.
    pub tables: Vec<TableDelta>,
    /// Highest mutation id of this client the server has processed.
    pub last_mutation_id: u64,
}

impl PullResponse {
    /// Creates a new pull response.
    pub fn new(epoch: impl Into<String>, tables: Vec<TableDelta>, last_mutation_id: u64) -> Self {
        Self {
            epoch: epoch.into(),
            tables,
            last_mutation_id,
        }
    }

    /// Returns true if any table has more changes waiting.
    pub fn has_more(&self) -> bool {
        self.tables.iter().any(|t| t.has_more)
    }
}

/// Push request from client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Client id.
    pub client_id: String,
    /// Mutations in submission order.
    pub mutations: Vec<Mutation>,
    /// Conflict policy the mutations were prepared for.
    pub policy: ConflictPolicy,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(client_id: impl Into<String>, mutations: Vec<Mutation>) -> Self {
        Self {
            client_id: client_id.into(),
            mutations,
            policy: ConflictPolicy::default(),
        }
    }

    /// Sets the conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// An authoritative row returned by push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePatch {
    /// Table name.
    pub table: String,
    /// The change.
    pub patch: RowPatch,
}

/// Push response from server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// One outcome per processed mutation, in request order.
    pub outcomes: Vec<MutationOutcome>,
    /// Current authoritative state of every row the mutations touched.
    pub rows: Vec<TablePatch>,
    /// Stale writes that were rejected.
    pub conflicts: Vec<Conflict>,
    /// Highest mutation id of this client the server has processed.
    pub last_mutation_id: u64,
}

impl PushResponse {
    /// Creates a push response.
    pub fn new(outcomes: Vec<MutationOutcome>, last_mutation_id: u64) -> Self {
        Self {
            outcomes,
            rows: Vec::new(),
            conflicts: Vec::new(),
            last_mutation_id,
        }
    }
}

/// Error reply for a request the server could not process at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Numeric status, mirroring the HTTP status.
    pub status: u16,
    /// Error message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error reply.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

wire_message!(
    SyncMessage,
    HandshakeRequest,
    HandshakeResponse,
    PullRequest,
    PullResponse,
    PushRequest,
    PushResponse,
    ErrorResponse,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireMessage;
    use crate::outcome::MutationError;
    use rowsync_core::{MutationKind, MutationOp};

    #[test]
    fn handshake_request_roundtrip() {
        let req = HandshakeRequest::new("client-1", "abcd").with_epoch(Some("e1".into()));
        let decoded = HandshakeRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn handshake_response_error() {
        let resp = HandshakeResponse::error("schema mismatch");
        let decoded = HandshakeResponse::decode(&resp.encode().unwrap()).unwrap();
        assert!(!decoded.success);
        assert_eq!(decoded.error.as_deref(), Some("schema mismatch"));
    }

    #[test]
    fn pull_response_with_patches() {
        let key = RowKey::single("b1");
        let resp = PullResponse::new(
            "e1",
            vec![
                TableDelta::snapshot(
                    "user",
                    vec![RowPatch::Put {
                        key: RowKey::single("u1"),
                        row: Row::new().with("id", "u1").with("age", 3i64),
                        version: 4,
                    }],
                    9,
                ),
                TableDelta::delta("block", vec![RowPatch::Delete { key: key.clone() }], 7, true),
            ],
            3,
        );
        let decoded = PullResponse::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded, resp);
        assert!(decoded.has_more());
        assert_eq!(decoded.tables[1].patches[0].key(), &key);
    }

    #[test]
    fn push_roundtrip() {
        let req = PushRequest::new(
            "client-1",
            vec![Mutation::new(
                1,
                MutationKind::new("block", MutationOp::Delete, Row::new().with("id", "b1")),
            )],
        )
        .with_policy(ConflictPolicy::RejectStale);
        let decoded = PushRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);

        let resp = PushResponse::new(
            vec![
                MutationOutcome::applied(1),
                MutationOutcome::rejected(2, MutationError::internal("boom")),
            ],
            2,
        );
        let decoded = PushResponse::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn sync_message_type_codes() {
        assert_eq!(
            SyncMessage::HandshakeRequest(HandshakeRequest::new("c", "s")).type_code(),
            1
        );
        assert_eq!(
            SyncMessage::PullRequest(PullRequest::new("c", vec![], 10)).type_code(),
            3
        );
        assert_eq!(
            SyncMessage::PushResponse(PushResponse::new(vec![], 0)).type_code(),
            6
        );
        assert_eq!(
            SyncMessage::Error(ErrorResponse::new(400, "bad")).type_code(),
            7
        );
    }
}
