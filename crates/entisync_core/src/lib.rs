//! # entisync core
//!
//! Building blocks shared by every entisync crate.
//!
//! This crate provides:
//! - `CoreError`, the error taxonomy carried by tasks and jobs
//! - `EventLoop`, the single-threaded reactor all jobs and tasks run on
//! - `Task<T>`, a single-assignment result cell with continuations
//! - Fan-out/fan-in combinators (`task_for_each`, `task_collect`)
//!
//! ## Concurrency model
//!
//! Everything runs on one thread. Work is suspended only while waiting for
//! the event loop to deliver the next event; the one blocking construct is
//! [`Task::wait`], which pumps the loop until the task settles.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod combinators;
mod error;
mod event_loop;
mod task;

pub use combinators::{task_collect, task_collect_flat, task_for_each};
pub use error::{CoreError, CoreResult, USER_DEFINED_ERROR_BASE};
pub use event_loop::EventLoop;
pub use task::Task;
