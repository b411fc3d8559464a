//! HTTP endpoints for the sync server.
//!
//! `POST /sync/{handshake,pull,push}` take and return CBOR bodies and read
//! the identity from `Authorization: Bearer <token>`. `GET /health` reports
//! liveness as JSON.

use crate::error::{ServerError, ServerResult};
use crate::server::SyncServer;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const CBOR: &str = "application/cbor";

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Store epoch.
    pub epoch: String,
    /// Latest committed change-log position.
    pub head: u64,
}

/// Builds the HTTP router with all endpoints.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync/:endpoint", post(sync_handler))
        .layer(Extension(server))
}

/// Binds `bind_addr` from the server config and serves until the task is
/// cancelled.
pub async fn serve(server: Arc<SyncServer>) -> ServerResult<()> {
    let addr = server.config().bind_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, schema = server.registry().version(), "sync server listening");
    axum::serve(listener, build_router(server)).await?;
    Ok(())
}

async fn health_handler(Extension(server): Extension<Arc<SyncServer>>) -> Json<HealthStatus> {
    let store = server.store();
    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        epoch: store.epoch().to_string(),
        head: store.head(),
    })
}

async fn sync_handler(
    Extension(server): Extension<Arc<SyncServer>>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let credential = bearer_token(&headers);
    let timeout = server.config().request_timeout;
    let path = format!("/sync/{endpoint}");

    // Store transactions hold a blocking lock.
    let work = tokio::task::spawn_blocking(move || {
        server.handle_post(&path, credential.as_deref(), &body)
    });
    let (status, reply) = match tokio::time::timeout(timeout, work).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => return internal_error(ServerError::Internal(err.to_string())),
        Err(_) => {
            warn!(endpoint = %endpoint, "request timed out");
            return internal_error(ServerError::Internal("request timed out".into()));
        }
    };

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, CBOR)], reply).into_response()
}

fn internal_error(err: ServerError) -> Response {
    warn!(error = %err, "sync handler failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

/// Extracts the token of an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::identity::StaticIdentityResolver;
    use axum::body::Body;
    use axum::http::Request;
    use rowsync_core::{
        ColumnType, Identity, MutatorRegistry, PermissionSet, SchemaRegistry, TableSchema,
    };
    use rowsync_protocol::{ErrorResponse, HandshakeRequest, HandshakeResponse, WireMessage};
    use tower::util::ServiceExt;

    fn test_server() -> Arc<SyncServer> {
        let registry = SchemaRegistry::builder()
            .table(
                TableSchema::builder("note")
                    .column("id", ColumnType::Text)
                    .primary_key(["id"])
                    .build(),
            )
            .build()
            .unwrap();
        let server = SyncServer::new(
            ServerConfig::default().with_required_auth(),
            registry,
            PermissionSet::open(),
            MutatorRegistry::new(),
        )
        .unwrap()
        .with_identity_resolver(StaticIdentityResolver::new().with_token("t1", Identity::new("u1")));
        Arc::new(server)
    }

    fn handshake(server: &SyncServer, token: Option<&str>) -> Request<Body> {
        let body = HandshakeRequest::new("c1", server.registry().version())
            .encode()
            .unwrap();
        let mut request = Request::builder()
            .method("POST")
            .uri("/sync/handshake")
            .header(header::CONTENT_TYPE, CBOR);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        request.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = build_router(test_server());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn handshake_over_http() {
        let server = test_server();
        let app = build_router(Arc::clone(&server));

        let response = app
            .oneshot(handshake(&server, Some("t1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply = HandshakeResponse::decode(&body).unwrap();
        assert!(reply.success);
        assert_eq!(reply.epoch, server.store().epoch());
    }

    #[tokio::test]
    async fn missing_credential_is_unauthorized() {
        let server = test_server();
        let app = build_router(Arc::clone(&server));

        let response = app.oneshot(handshake(&server, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(ErrorResponse::decode(&body).unwrap().status, 401);
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.3.0".to_string(),
            epoch: "e1".to_string(),
            head: 42,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"head\":42"));
    }
}
