//! # rowsync client
//!
//! Local replica, live queries and sync engine for rowsync.
//!
//! This crate provides:
//! - An in-memory replica of the rows the identity can read, persisted
//!   between runs through a [`CacheStore`]
//! - Optimistic mutations with server confirmation per mutation
//! - Live queries maintained incrementally as rows change
//! - The connection state machine and sync engine
//! - HTTP transport abstraction, a loopback for tests and, with the
//!   `reqwest` feature, a blocking client for real servers
//!
//! ## Architecture
//!
//! Every sync cycle is **handshake, pull, push**:
//! 1. Handshake to learn the server epoch (a new epoch resets cursors)
//! 2. Pull row changes per table until caught up
//! 3. Push pending mutations in id order
//!
//! Server rows land in the replica's base layer. Pending mutations are
//! re-run on top of it after every server update, so the application always
//! sees server state plus its own unconfirmed changes.
//!
//! ## Key Invariants
//!
//! - Reads and mutations never wait for the network
//! - A mutation that fails locally is never sent
//! - Pending mutations are pushed in order and retried with the same id
//! - A rejected mutation is rolled back locally

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod client;
mod config;
mod dispatch;
mod driver;
mod error;
mod http;
mod live;
mod state;
mod transport;

pub use cache::{CacheState, CacheStore, CachedRow, FileCacheStore, MemoryCacheStore, Replica};
pub use client::{Client, ClientBuilder, ClientEngine};
pub use config::{ClientConfig, RetryConfig};
pub use dispatch::MutationHandle;
pub use driver::SyncLoop;
pub use error::{ClientError, ClientResult};
pub use http::{HttpClient, HttpReply, HttpTransport, LoopbackClient, LoopbackServer};
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
pub use live::{LiveQuery, QuerySnapshot, QueryStatus};
pub use state::{
    ConnectionState, PushSummary, SyncApplier, SyncCycleResult, SyncEngine, SyncStats,
};
pub use transport::{MockTransport, SyncTransport};
