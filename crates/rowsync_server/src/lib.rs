//! # rowsync server
//!
//! Authoritative sync server for rowsync.
//!
//! This crate provides:
//! - A transactional row store with a change log and per-client mutation
//!   tracking
//! - Request handlers for handshake, pull and push
//! - Identity resolution from bearer credentials
//! - A background worker for post-commit side tasks
//! - HTTP endpoints (axum)
//!
//! # Protocol
//!
//! The server implements pull-then-push synchronization:
//! 1. Client handshakes with its client id, protocol and schema versions
//! 2. Client pulls changed rows per table since its cursors, filtered by
//!    the read rules for its identity
//! 3. Client pushes pending mutations; each one is deduplicated by id,
//!    re-checked and executed in its own transaction
//! 4. The push response reports one outcome per mutation plus the
//!    authoritative state of every touched row

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod http;
mod identity;
mod server;
mod store;
mod tasks;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use http::{build_router, serve, HealthStatus};
pub use identity::{IdentityResolver, StaticIdentityResolver};
pub use server::SyncServer;
pub use store::{Execution, Store};
pub use tasks::TaskQueue;
