//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so any HTTP library
//! (or an in-process loopback) can carry the CBOR bodies.

use crate::error::{ClientError, ClientResult};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use rowsync_protocol::{
    ErrorResponse, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, WireMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// An HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpReply {
    /// A 200 reply.
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. `Err` means
/// the request never produced a response (connection refused, reset,
/// timed out).
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with an optional bearer token.
    fn post(&self, url: &str, bearer: Option<&str>, body: Vec<u8>) -> Result<HttpReply, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
///
/// Uses CBOR encoding for request/response bodies and sends the identity
/// token as `Authorization: Bearer`.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Bearer token of the current identity.
    token: RwLock<Option<String>>,
    /// Outcome of the last request.
    connected: AtomicBool,
    /// Set by `close`.
    closed: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token: RwLock::new(None),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the bearer token.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.set_token(Some(token.into()));
        self
    }

    /// Replaces the bearer token, e.g. after the user logs in or out.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> ClientResult<Res>
    where
        Req: WireMessage,
        Res: WireMessage,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::transport_fatal("transport closed"));
        }

        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, endpoint);
        let token = self.token.read().clone();
        debug!(url = %url, bytes = body.len(), "sync request");

        let reply = self.client.post(&url, token.as_deref(), body).map_err(|e| {
            warn!(url = %url, error = %e, "sync request failed");
            self.set_error(&e);
            self.connected.store(false, Ordering::SeqCst);
            ClientError::transport_retryable(e)
        })?;
        self.connected.store(true, Ordering::SeqCst);

        if !reply.is_success() {
            let message = ErrorResponse::decode(&reply.body)
                .map(|e| e.message)
                .unwrap_or_else(|_| format!("HTTP {}", reply.status));
            self.set_error(&message);
            return Err(match reply.status {
                401 | 403 => ClientError::AuthenticationFailed(message),
                status if status >= 500 => ClientError::ServerError(message),
                _ => ClientError::Protocol(message),
            });
        }

        *self.last_error.write() = None;
        Res::decode(&reply.body).map_err(ClientError::from)
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn handshake(&self, request: &HandshakeRequest) -> ClientResult<HandshakeResponse> {
        self.post_cbor("/sync/handshake", request)
    }

    fn pull(&self, request: &PullRequest) -> ClientResult<PullResponse> {
        self.post_cbor("/sync/pull", request)
    }

    fn push(&self, request: &PushRequest) -> ClientResult<PushResponse> {
        self.post_cbor("/sync/push", request)
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.connected.load(Ordering::SeqCst)
            && self.client.is_healthy()
    }

    fn close(&self) -> ClientResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST of a CBOR body to `path`, returning status and body.
    fn handle_post(&self, path: &str, bearer: Option<&str>, body: &[u8]) -> (u16, Vec<u8>);
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead. Can be switched
/// offline to simulate connection loss.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    online: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, bearer: Option<&str>, body: Vec<u8>) -> Result<HttpReply, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        let (status, body) = self.server.handle_post(path, bearer, &body);
        Ok(HttpReply { status, body })
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for std::sync::Arc<S> {
    fn handle_post(&self, path: &str, bearer: Option<&str>, body: &[u8]) -> (u16, Vec<u8>) {
        (**self).handle_post(path, bearer, body)
    }
}

/// [`HttpClient`] over a blocking `reqwest` client.
///
/// Requests block the calling thread; the sync loop already runs cycles on
/// the blocking pool.
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
    healthy: std::sync::Arc<AtomicBool>,
}

#[cfg(feature = "reqwest")]
impl ReqwestClient {
    /// Creates a client whose requests give up after `timeout`.
    pub fn new(timeout: std::time::Duration) -> ClientResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::transport_fatal(e.to_string()))?;
        Ok(Self {
            client,
            healthy: std::sync::Arc::new(AtomicBool::new(true)),
        })
    }
}

#[cfg(feature = "reqwest")]
impl HttpClient for ReqwestClient {
    fn post(&self, url: &str, bearer: Option<&str>, body: Vec<u8>) -> Result<HttpReply, String> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/cbor")
            .body(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let result = request.send().and_then(|response| {
            let status = response.status().as_u16();
            response.bytes().map(|body| HttpReply {
                status,
                body: body.to_vec(),
            })
        });
        self.healthy.store(result.is_ok(), Ordering::SeqCst);
        result.map_err(|e| e.to_string())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
