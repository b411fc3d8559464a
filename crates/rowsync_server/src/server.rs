//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::identity::{IdentityResolver, StaticIdentityResolver};
use crate::store::Store;
use rowsync_core::{Identity, MutatorRegistry, PermissionSet, SchemaRegistry};
use rowsync_protocol::{
    ErrorResponse, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, SyncMessage, WireMessage,
};
use std::sync::Arc;
use tracing::{debug, error};

/// The sync server.
///
/// Owns the authoritative store and processes handshake, pull and push
/// requests. Transport is left to the caller: [`crate::build_router`]
/// exposes it over HTTP, and [`SyncServer::handle_post`] serves raw CBOR
/// bodies for in-process transports.
///
/// # Example
///
/// ```
/// use rowsync_core::{ColumnType, MutatorRegistry, PermissionSet, SchemaRegistry, TableSchema};
/// use rowsync_server::{ServerConfig, SyncServer};
///
/// let registry = SchemaRegistry::builder()
///     .table(
///         TableSchema::builder("note")
///             .column("id", ColumnType::Text)
///             .primary_key(["id"])
///             .build(),
///     )
///     .build()
///     .unwrap();
/// let server = SyncServer::new(
///     ServerConfig::default(),
///     registry,
///     PermissionSet::open(),
///     MutatorRegistry::new(),
/// )
/// .unwrap();
/// assert_eq!(server.store().head(), 0);
/// ```
#[derive(Debug)]
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    resolver: Arc<dyn IdentityResolver>,
}

impl SyncServer {
    /// Creates a new sync server. Every request is anonymous until an
    /// identity resolver is installed.
    pub fn new(
        config: ServerConfig,
        registry: SchemaRegistry,
        permissions: PermissionSet,
        mutators: MutatorRegistry,
    ) -> ServerResult<Self> {
        let context = Arc::new(HandlerContext::new(
            config,
            registry,
            permissions,
            mutators,
        )?);
        let handler = RequestHandler::new(Arc::clone(&context));
        Ok(Self {
            handler,
            context,
            resolver: Arc::new(StaticIdentityResolver::new()),
        })
    }

    /// Installs the credential resolver.
    pub fn with_identity_resolver(mut self, resolver: impl IdentityResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Resolves a bearer credential, enforcing `require_auth`.
    pub fn authenticate(&self, credential: Option<&str>) -> ServerResult<Option<Identity>> {
        let identity = self.resolver.resolve(credential)?;
        if identity.is_none() && self.context.config.require_auth {
            return Err(ServerError::AuthenticationFailed(
                "credential required".into(),
            ));
        }
        Ok(identity)
    }

    /// Handles a handshake request.
    pub fn handle_handshake(
        &self,
        request: HandshakeRequest,
        credential: Option<&str>,
    ) -> ServerResult<HandshakeResponse> {
        self.authenticate(credential)?;
        self.handler.handle_handshake(request)
    }

    /// Handles a pull request.
    pub fn handle_pull(
        &self,
        request: PullRequest,
        credential: Option<&str>,
    ) -> ServerResult<PullResponse> {
        let identity = self.authenticate(credential)?;
        self.handler.handle_pull(request, identity.as_ref())
    }

    /// Handles a push request.
    pub fn handle_push(
        &self,
        request: PushRequest,
        credential: Option<&str>,
    ) -> ServerResult<PushResponse> {
        let identity = self.authenticate(credential)?;
        self.handler.handle_push(request, identity.as_ref())
    }

    /// Handles a sync message (dispatches to appropriate handler). Failures
    /// come back as [`SyncMessage::Error`].
    pub fn handle_message(&self, message: SyncMessage, credential: Option<&str>) -> SyncMessage {
        let result = match message {
            SyncMessage::HandshakeRequest(req) => self
                .handle_handshake(req, credential)
                .map(SyncMessage::HandshakeResponse),
            SyncMessage::PullRequest(req) => self
                .handle_pull(req, credential)
                .map(SyncMessage::PullResponse),
            SyncMessage::PushRequest(req) => self
                .handle_push(req, credential)
                .map(SyncMessage::PushResponse),
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        };
        result.unwrap_or_else(|err| SyncMessage::Error(error_response(&err)))
    }

    /// Serves a CBOR request body posted to `path`
    /// (`/sync/handshake`, `/sync/pull` or `/sync/push`).
    ///
    /// Returns the HTTP status and the CBOR response body. Errors are
    /// encoded as an [`ErrorResponse`].
    pub fn handle_post(&self, path: &str, credential: Option<&str>, body: &[u8]) -> (u16, Vec<u8>) {
        let endpoint = path.trim_start_matches('/');
        let endpoint = endpoint.strip_prefix("sync/").unwrap_or(endpoint);
        debug!(endpoint, bytes = body.len(), "sync request");

        let result = match endpoint {
            "handshake" => HandshakeRequest::decode(body)
                .map_err(ServerError::from)
                .and_then(|req| self.handle_handshake(req, credential))
                .and_then(|resp| resp.encode().map_err(ServerError::from)),
            "pull" => PullRequest::decode(body)
                .map_err(ServerError::from)
                .and_then(|req| self.handle_pull(req, credential))
                .and_then(|resp| resp.encode().map_err(ServerError::from)),
            "push" => PushRequest::decode(body)
                .map_err(ServerError::from)
                .and_then(|req| self.handle_push(req, credential))
                .and_then(|resp| resp.encode().map_err(ServerError::from)),
            other => Err(ServerError::NotFound(format!("/sync/{other}"))),
        };

        match result {
            Ok(bytes) => (200, bytes),
            Err(err) => {
                let reply = error_response(&err);
                (reply.status, reply.encode().unwrap_or_default())
            }
        }
    }

    /// The authoritative store.
    pub fn store(&self) -> &Arc<Store> {
        &self.context.store
    }

    /// The schema declarations.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.context.registry
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Blocks until every side task queued so far has run.
    pub fn flush_tasks(&self) {
        self.context.tasks.flush();
    }
}

fn error_response(err: &ServerError) -> ErrorResponse {
    if err.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        debug!(error = %err, "request rejected");
    }
    ErrorResponse::new(err.status_code(), err.to_string())
}
