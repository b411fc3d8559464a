//! The demo application served by `rowsync serve`.
//!
//! Users can block other users and book courts. Blocks are private to the
//! blocker; bookings are public but only their owner may change them.

use rowsync_core::{
    col, Cardinality, ColumnType, CoreError, CoreResult, Identity, IdentityField, MutatorRegistry,
    PermissionSet, Policy, Relationship, Row, SchemaRegistry, TablePermissions, TableSchema,
    Transaction,
};
use rowsync_server::StaticIdentityResolver;
use tracing::info;

/// Table and relationship declarations.
pub fn registry() -> CoreResult<SchemaRegistry> {
    SchemaRegistry::builder()
        .table(
            TableSchema::builder("user")
                .column("id", ColumnType::Text)
                .column("name", ColumnType::Text)
                .optional("email", ColumnType::Text)
                .primary_key(["id"])
                .build(),
        )
        .table(
            TableSchema::builder("block")
                .column("id", ColumnType::Text)
                .column("blockerId", ColumnType::Text)
                .column("blockedId", ColumnType::Text)
                .primary_key(["id"])
                .build(),
        )
        .table(
            TableSchema::builder("booking")
                .column("id", ColumnType::Text)
                .column("userId", ColumnType::Text)
                .column("court", ColumnType::Text)
                .column("startsAt", ColumnType::Integer)
                .primary_key(["id"])
                .build(),
        )
        .relationship(Relationship::new(
            "user",
            "booking",
            "userId",
            "user",
            "id",
            Cardinality::One,
        ))
        .relationship(Relationship::new(
            "bookings",
            "user",
            "id",
            "booking",
            "userId",
            Cardinality::Many,
        ))
        .build()
}

/// Read and write rules, shared by server and clients.
pub fn permissions(registry: &SchemaRegistry) -> CoreResult<PermissionSet> {
    let me = Policy::Allow(col("id").eq_identity(IdentityField::Id));
    let blocker = Policy::Allow(col("blockerId").eq_identity(IdentityField::Id));
    let owner = Policy::Allow(col("userId").eq_identity(IdentityField::Id));

    PermissionSet::builder()
        .table(
            "user",
            TablePermissions::new()
                .select(Policy::Anyone)
                .insert(me.clone())
                .update(me)
                .delete(Policy::Nobody),
        )
        .table(
            "block",
            TablePermissions::new()
                .select(blocker.clone())
                .insert(blocker.clone())
                .delete(blocker),
        )
        .table(
            "booking",
            TablePermissions::new()
                .select(Policy::Anyone)
                .insert(owner.clone())
                .update(owner.clone())
                .delete(owner),
        )
        .build(registry)
}

/// Mutators as the clients run them.
pub fn mutators() -> MutatorRegistry {
    MutatorRegistry::new()
        .register("block", "blockUser", block_user)
        .register("booking", "reschedule", reschedule)
}

/// Mutators as the server runs them.
pub fn server_mutators() -> CoreResult<MutatorRegistry> {
    mutators().override_mutator("block", "blockUser", block_user_checked)
}

/// Demo bearer tokens: `token-<id>` for each listed user id.
pub fn identities<'a>(users: impl IntoIterator<Item = &'a str>) -> StaticIdentityResolver {
    users
        .into_iter()
        .fold(StaticIdentityResolver::new(), |resolver, id| {
            resolver.with_token(format!("token-{id}"), Identity::new(id))
        })
}

fn block_user(tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()> {
    let blocker = tx.identity()?.id.clone();
    tx.insert(
        "block",
        Row::new()
            .with("id", args.text("id")?)
            .with("blockerId", blocker)
            .with("blockedId", args.text("blockedId")?),
    )
}

fn block_user_checked(tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()> {
    let blocked = args.text("blockedId")?.to_string();
    if blocked == tx.identity()?.id {
        return Err(CoreError::validation("cannot block yourself"));
    }
    if tx.get("user", &Row::new().with("id", blocked.as_str()))?.is_none() {
        return Err(CoreError::validation(format!("no such user: {blocked}")));
    }
    block_user(tx, args)?;
    tx.defer("notify-blocked", move || {
        info!(user = %blocked, "user was blocked");
        Ok(())
    });
    Ok(())
}

fn reschedule(tx: &mut Transaction<'_>, args: &Row) -> CoreResult<()> {
    let starts_at = args.integer("startsAt")?;
    if starts_at < 0 {
        return Err(CoreError::validation("startsAt must not be negative"));
    }
    tx.update(
        "booking",
        Row::new()
            .with("id", args.text("id")?)
            .with("startsAt", starts_at),
    )
}
