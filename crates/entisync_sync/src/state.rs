//! Counters and notifications of a sync run.

/// Statistics about a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Remote entities applied.
    pub processed: usize,
    /// Local entities created.
    pub created: usize,
    /// Local entities modified.
    pub modified: usize,
    /// Matched entities found identical.
    pub unchanged: usize,
    /// Local entities deleted.
    pub deleted: usize,
    /// Transactions opened.
    pub transactions: usize,
}

impl SyncStats {
    /// Returns the number of mutations issued successfully.
    pub fn mutations(&self) -> usize {
        self.created + self.modified + self.deleted
    }
}

/// Notification emitted while a sync runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// The engine can accept this many more remote entities.
    ReadyForNextBatch(usize),
    /// A transaction was committed.
    TransactionCommitted,
}
