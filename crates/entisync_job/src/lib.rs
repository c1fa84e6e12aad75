//! # entisync job engine
//!
//! Executes trees of dependent operations over one multiplexed connection.
//!
//! This crate provides:
//! - `Session`, which owns the connection, allocates correlation tags and
//!   routes responses to the job currently allowed to receive them
//! - `JobHandler`/`JobHandle`, the job tree with strict FIFO dispatch of
//!   one current child at a time
//! - `TransactionSequence`, which brackets its subjobs with
//!   begin/commit/rollback
//! - Standard command jobs (`CommandJob`, `FetchJob`) and task-returning
//!   helpers (`fetch`, `create`, `modify`, `delete`)
//!
//! ## Execution model
//!
//! Sessions and jobs live on one [`EventLoop`](entisync_core::EventLoop).
//! Every handler callback is delivered from the loop, so a handler is never
//! re-entered while one of its own callbacks runs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod config;
mod connection;
mod job;
mod session;
mod transaction;

pub use command::{create, delete, fetch, modify, run, CommandJob, CommandOutput, FetchJob};
pub use config::SessionConfig;
pub use connection::Connection;
pub use job::{JobHandle, JobHandler, JobId, JobParent, KillMode};
pub use session::Session;
pub use transaction::{
    Tolerant, TransactionJob, TransactionOp, TransactionSequence, TransactionState,
};
