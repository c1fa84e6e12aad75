//! # entisync sync
//!
//! Reconciles a local mirror with a remote data set.
//!
//! This crate provides:
//! - `EntitySync`, a job that diffs remote entities against one local
//!   scope and issues the creates, modifies and deletes that converge them
//! - Full deliveries (the complete remote set, with deletion of everything
//!   not delivered) and incremental deliveries (changes and removals only)
//! - Batching with configurable transaction bracketing
//!   (`TransactionMode`)
//! - Streaming delivery with backpressure through `SyncEvent`s, and a
//!   pull adapter for `RemoteSource` producers
//! - A pluggable `UpdateCheck` deciding which matched entities differ
//!
//! ## Example
//!
//! ```rust,ignore
//! use entisync_sync::{EntitySync, SyncConfig};
//!
//! let sync = EntitySync::new(&session, SyncConfig::new(scope))?;
//! sync.feed_full(remote_entities)?;
//! let stats = sync.result().wait(&event_loop)?;
//! println!("created {} entities", stats.created);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod source;
mod state;
mod update;

pub use config::{SyncConfig, TransactionMode};
pub use engine::EntitySync;
pub use error::{SyncError, SyncResult};
pub use source::{Delivery, RemoteSource, VecSource};
pub use state::{SyncEvent, SyncStats};
pub use update::{DefaultUpdateCheck, UpdateCheck};
