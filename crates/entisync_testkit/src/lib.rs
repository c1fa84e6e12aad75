//! # entisync testkit
//!
//! Test utilities for entisync.
//!
//! This crate provides:
//! - `MemoryStore`, an in-memory store server with transaction staging,
//!   a command log and fault injection
//! - `LoopbackConnection`, a [`Connection`](entisync_job::Connection)
//!   talking to a `MemoryStore` on the same thread
//! - Test fixtures (`TestSession`, `init_tracing`)
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entisync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_session() {
//!     let test = TestSession::new();
//!     let items = fetch(&test.session, FetchJob::new(scope));
//!     assert!(test.wait(items).unwrap().is_empty());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod fixtures;
pub mod generators;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::store::*;
}

pub use connection::*;
pub use fixtures::*;
pub use generators::*;
pub use store::*;
