//! Error types for the sync engine.

use entisync_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the feed API.
///
/// Failures of the run itself are reported through
/// [`EntitySync::result`](crate::EntitySync::result) as [`CoreError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The run already finished.
    #[error("sync already finished")]
    Finished,

    /// Full and incremental deliveries were mixed in one run.
    #[error("cannot mix full and incremental deliveries")]
    ModeMismatch,

    /// Entities were delivered after delivery was declared done.
    #[error("delivery already done")]
    DeliveryDone,

    /// Error from the job layer.
    #[error("job error: {0}")]
    Core(#[from] CoreError),
}
