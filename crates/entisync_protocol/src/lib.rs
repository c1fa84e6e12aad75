//! # entisync protocol
//!
//! Types exchanged between a session and the store it mirrors.
//!
//! This crate provides:
//! - `Tag`, the per-request correlation number
//! - `Command`/`Response`, the request vocabulary
//! - `RemoteEntity`/`LocalEntity`, the two sides of a reconciliation
//! - `Inbound`, what a connection delivers to its session
//!
//! This is a pure protocol crate with no I/O operations. All types derive
//! serde traits; the byte format is left to the codec that ships them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod entity;
mod error;
mod tag;

pub use command::{Command, FetchDepth, FetchSelector, Inbound, Response};
pub use entity::{EntityKind, Gid, LocalEntity, LocalId, RemoteEntity, Rid, Scope};
pub use error::{ProtocolError, ProtocolResult};
pub use tag::{Tag, TagAllocator};

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 4;
