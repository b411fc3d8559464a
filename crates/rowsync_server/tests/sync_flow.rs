//! End-to-end server behaviour over the CBOR entry point.

use rowsync_core::{
    col, ColumnType, CoreResult, Identity, IdentityField, Mutation, MutationKind, MutationOp,
    MutatorRegistry, PermissionSet, Policy, Row, RowKey, SchemaRegistry, TablePermissions,
    TableSchema, Transaction,
};
use rowsync_protocol::{
    ErrorKind, HandshakeRequest, HandshakeResponse, Outcome, PullRequest, PullResponse,
    PushRequest, PushResponse, RowPatch, TableCursor, WireMessage,
};
use rowsync_server::{ServerConfig, StaticIdentityResolver, SyncServer};

fn block_user(tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()> {
    let me = tx.identity()?.id.clone();
    let blocked = args.text("blockedId")?.to_string();
    let id = args.text("id")?.to_string();
    tx.insert(
        "block",
        Row::new()
            .with("id", id)
            .with("blockerId", me)
            .with("blockedId", blocked),
    )
}

fn server() -> SyncServer {
    let registry = SchemaRegistry::builder()
        .table(
            TableSchema::builder("block")
                .column("id", ColumnType::Text)
                .column("blockerId", ColumnType::Text)
                .column("blockedId", ColumnType::Text)
                .primary_key(["id"])
                .build(),
        )
        .build()
        .unwrap();
    let mine = Policy::Allow(col("blockerId").eq_identity(IdentityField::Id));
    let permissions = PermissionSet::builder()
        .table(
            "block",
            TablePermissions::new()
                .select(mine.clone())
                .insert(mine.clone())
                .delete(mine),
        )
        .build(&registry)
        .unwrap();
    let mutators = MutatorRegistry::new().register("block", "blockUser", block_user);
    SyncServer::new(
        ServerConfig::default().with_change_log_retention(4),
        registry,
        permissions,
        mutators,
    )
    .unwrap()
    .with_identity_resolver(
        StaticIdentityResolver::new()
            .with_token("tok-a", Identity::new("A"))
            .with_token("tok-b", Identity::new("B")),
    )
}

fn post<Req: WireMessage, Resp: WireMessage>(
    server: &SyncServer,
    path: &str,
    token: &str,
    request: &Req,
) -> Resp {
    let (status, body) = server.handle_post(path, Some(token), &request.encode().unwrap());
    assert_eq!(status, 200, "{path} failed");
    Resp::decode(&body).unwrap()
}

fn block(id: u64, target: &str) -> Mutation {
    Mutation::new(
        id,
        MutationKind::new(
            "block",
            MutationOp::custom("blockUser"),
            Row::new()
                .with("id", format!("blk-{target}"))
                .with("blockedId", target),
        ),
    )
}

fn unblock(id: u64, target: &str) -> Mutation {
    Mutation::new(
        id,
        MutationKind::new(
            "block",
            MutationOp::Delete,
            Row::new().with("id", format!("blk-{target}")),
        ),
    )
}

#[test]
fn two_clients_see_only_their_rows() {
    let server = server();
    let schema = server.registry().version().to_string();

    let hello: HandshakeResponse = post(
        &server,
        "/sync/handshake",
        "tok-a",
        &HandshakeRequest::new("client-a", schema),
    );
    assert!(hello.success);
    assert_eq!(hello.last_mutation_id, 0);

    let _: PushResponse = post(
        &server,
        "/sync/push",
        "tok-a",
        &PushRequest::new("client-a", vec![block(1, "x"), block(2, "y")]),
    );
    let _: PushResponse = post(
        &server,
        "/sync/push",
        "tok-b",
        &PushRequest::new("client-b", vec![block(1, "z")]),
    );

    let pull = PullRequest::new("client-a", vec![TableCursor::new("block", None)], 100);
    let a_view: PullResponse = post(&server, "/sync/pull", "tok-a", &pull);
    let keys: Vec<_> = a_view.tables[0].patches.iter().map(|p| p.key().clone()).collect();
    assert_eq!(
        keys,
        vec![RowKey::single("blk-x"), RowKey::single("blk-y")]
    );
    assert_eq!(a_view.last_mutation_id, 2);
}

#[test]
fn foreign_delete_is_denied_and_retry_is_idempotent() {
    let server = server();
    let _: PushResponse = post(
        &server,
        "/sync/push",
        "tok-a",
        &PushRequest::new("client-a", vec![block(1, "x")]),
    );

    let stolen: PushResponse = post(
        &server,
        "/sync/push",
        "tok-b",
        &PushRequest::new("client-b", vec![unblock(1, "x")]),
    );
    assert_eq!(
        stolen.outcomes[0].error().map(|e| e.kind),
        Some(ErrorKind::PermissionDenied)
    );
    // B cannot read A's row, so the authoritative state comes back as a delete.
    assert!(matches!(stolen.rows[0].patch, RowPatch::Delete { .. }));
    assert_eq!(server.store().row_count("block"), 1);

    let request = PushRequest::new("client-a", vec![unblock(2, "x")]);
    let first: PushResponse = post(&server, "/sync/push", "tok-a", &request);
    let retry: PushResponse = post(&server, "/sync/push", "tok-a", &request);
    assert_eq!(first.outcomes[0].outcome, Outcome::Applied);
    assert_eq!(retry.outcomes[0].outcome, Outcome::AlreadyProcessed);
    assert_eq!(server.store().row_count("block"), 0);
}

#[test]
fn lagging_cursor_falls_back_to_snapshot() {
    let server = server();
    let schema = server.registry().version().to_string();
    let hello: HandshakeResponse = post(
        &server,
        "/sync/handshake",
        "tok-a",
        &HandshakeRequest::new("client-a", schema),
    );

    let mutations = (1..=6).map(|i| block(i, &format!("u{i}"))).collect();
    let _: PushResponse = post(
        &server,
        "/sync/push",
        "tok-a",
        &PushRequest::new("client-a", mutations),
    );

    let pull = PullRequest::new("client-a", vec![TableCursor::new("block", Some(1))], 100)
        .with_epoch(Some(hello.epoch));
    let response: PullResponse = post(&server, "/sync/pull", "tok-a", &pull);
    assert!(response.tables[0].reset);
    assert_eq!(response.tables[0].patches.len(), 6);
    assert_eq!(response.tables[0].cursor, 6);
}
