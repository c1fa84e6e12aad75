//! Test fixtures and session helpers.

use crate::connection::LoopbackConnection;
use crate::store::MemoryStore;
use entisync_core::{CoreResult, EventLoop, Task};
use entisync_job::{Session, SessionConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A session connected to a fresh [`MemoryStore`].
pub struct TestSession {
    /// The event loop everything runs on.
    pub event_loop: EventLoop,
    /// The store behind the session's connection.
    pub store: MemoryStore,
    /// The session under test.
    pub session: Session,
}

impl TestSession {
    /// Creates a session over an empty store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Creates a session over `store`.
    pub fn with_store(store: MemoryStore) -> Self {
        Self::with_config(store, SessionConfig::new("test-session"))
    }

    /// Creates a session over `store` with a custom configuration.
    pub fn with_config(store: MemoryStore, config: SessionConfig) -> Self {
        init_tracing();
        let event_loop = EventLoop::new().expect("Failed to create event loop");
        let connection = LoopbackConnection::new(store.clone());
        let session = Session::new(&event_loop, connection, config);
        Self {
            event_loop,
            store,
            session,
        }
    }

    /// Pumps the event loop until `task` settles.
    pub fn wait<T: 'static>(&self, task: Task<T>) -> CoreResult<T> {
        task.wait(&self.event_loop)
    }

    /// Pumps the event loop for `duration`.
    pub fn run_for(&self, duration: Duration) {
        self.event_loop
            .block_on(async move { tokio::time::sleep(duration).await });
    }

    /// Pumps the event loop for a few ticks.
    pub fn settle(&self) {
        self.event_loop.block_on(async {
            for _ in 0..64 {
                tokio::task::yield_now().await;
            }
        });
    }
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestSession {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}
