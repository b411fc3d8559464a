//! The blocking `reqwest` client against the axum server on a real socket.

#![cfg(feature = "reqwest")]

use rowsync_client::{
    Client, ClientConfig, HttpTransport, QueryStatus, ReqwestClient, SyncTransport,
};
use rowsync_core::{
    col, ColumnType, Identity, IdentityField, MutatorRegistry, PermissionSet, Policy, Query, Row,
    SchemaRegistry, TablePermissions, TableSchema,
};
use rowsync_server::{build_router, ServerConfig, StaticIdentityResolver, SyncServer};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn registry() -> SchemaRegistry {
    SchemaRegistry::builder()
        .table(
            TableSchema::builder("note")
                .column("id", ColumnType::Text)
                .column("ownerId", ColumnType::Text)
                .column("body", ColumnType::Text)
                .primary_key(["id"])
                .build(),
        )
        .build()
        .unwrap()
}

fn permissions(registry: &SchemaRegistry) -> PermissionSet {
    let owner = Policy::Allow(col("ownerId").eq_identity(IdentityField::Id));
    PermissionSet::builder()
        .table(
            "note",
            TablePermissions::new()
                .select(owner.clone())
                .insert(owner.clone())
                .delete(owner),
        )
        .build(registry)
        .unwrap()
}

/// Serves on an ephemeral port from a runtime of its own.
fn start(server: Arc<SyncServer>) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, build_router(server)).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

fn client(addr: SocketAddr, token: Option<&str>, identity: Option<Identity>) -> Client {
    let base_url = format!("http://{addr}");
    let http = ReqwestClient::new(Duration::from_secs(5)).unwrap();
    let transport = HttpTransport::new(base_url.clone(), http);
    transport.set_token(token.map(str::to_string));
    let registry = registry();
    let permissions = permissions(&registry);
    Client::builder(
        ClientConfig::new(rowsync_core::new_id(), base_url),
        registry,
        Arc::new(transport) as Arc<dyn SyncTransport>,
    )
    .permissions(permissions)
    .identity(identity)
    .init()
    .unwrap()
}

#[test]
fn syncs_over_http() {
    let registry = registry();
    let permissions = permissions(&registry);
    let server = Arc::new(
        SyncServer::new(
            ServerConfig::default(),
            registry,
            permissions,
            MutatorRegistry::new(),
        )
        .unwrap()
        .with_identity_resolver(
            StaticIdentityResolver::new().with_token("tok-a", Identity::new("A")),
        ),
    );
    let addr = start(Arc::clone(&server));

    let alice = client(addr, Some("tok-a"), Some(Identity::new("A")));
    let notes = alice.query(&Query::table("note")).unwrap();
    let mut handle = alice
        .insert(
            "note",
            Row::new()
                .with("id", "n1")
                .with("ownerId", "A")
                .with("body", "hello"),
        )
        .unwrap();

    let result = alice.sync().unwrap();
    assert_eq!(result.pushed, 1);
    assert!(matches!(handle.try_result(), Some(Ok(()))));
    assert_eq!(notes.status(), QueryStatus::Complete);
    assert_eq!(server.store().row_count("note"), 1);

    // A second device of the same user sees the row after its first pull.
    let again = client(addr, Some("tok-a"), Some(Identity::new("A")));
    again.sync().unwrap();
    assert_eq!(again.run_query(&Query::table("note")).unwrap().len(), 1);
}

#[test]
fn unreachable_server_is_retryable() {
    let http = ReqwestClient::new(Duration::from_millis(500)).unwrap();
    // Port 9 (discard) is closed on test hosts.
    let transport = HttpTransport::new("http://127.0.0.1:9", http);
    let registry = registry();
    let permissions = permissions(&registry);
    let client = Client::builder(
        ClientConfig::new(rowsync_core::new_id(), "http://127.0.0.1:9"),
        registry,
        Arc::new(transport) as Arc<dyn SyncTransport>,
    )
    .permissions(permissions)
    .init()
    .unwrap();

    let err = client.sync().unwrap_err();
    assert!(err.is_retryable());
}
