//! # rowsync protocol
//!
//! Sync protocol types and CBOR codecs for rowsync.
//!
//! This crate provides:
//! - Protocol messages (Handshake, Pull, Push)
//! - Per-mutation outcomes and error kinds
//! - `ConflictPolicy` and `Conflict`
//! - `PendingLog` for the client's unconfirmed mutations
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod messages;
mod oplog;
mod outcome;

pub use codec::{from_cbor, to_cbor, ProtocolError, ProtocolResult, WireMessage};
pub use conflict::{Conflict, ConflictPolicy};
pub use messages::{
    ErrorResponse, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, RowPatch, SyncMessage, TableCursor, TableDelta, TablePatch, PROTOCOL_VERSION,
};
pub use oplog::PendingLog;
pub use outcome::{ErrorKind, MutationError, MutationOutcome, Outcome};
