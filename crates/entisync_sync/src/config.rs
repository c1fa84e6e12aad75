//! Configuration for the sync engine.

use entisync_protocol::Scope;

/// How batches are bracketed in transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// One transaction for the whole run.
    #[default]
    Single,
    /// One transaction per batch, committed before the next batch starts.
    Multiple,
    /// No transactions; batches are applied as plain job groups.
    None,
}

/// Configuration for one sync run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The set of local entities being mirrored.
    pub scope: Scope,
    /// Number of remote entities applied per batch.
    pub batch_size: usize,
    /// Transaction bracketing of batches.
    pub transaction_mode: TransactionMode,
    /// Whether the producer delivers in several chunks.
    ///
    /// Without streaming, the first delivery is also the last.
    pub streaming: bool,
    /// Whether reaching the declared total implies delivery done.
    pub auto_delivery_done: bool,
}

impl SyncConfig {
    /// Creates a configuration for `scope`.
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            batch_size: 10,
            transaction_mode: TransactionMode::Single,
            streaming: false,
            auto_delivery_done: true,
        }
    }

    /// Sets the batch size. Zero is treated as one.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the transaction mode.
    #[must_use]
    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Enables streaming delivery.
    #[must_use]
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Sets whether reaching the declared total implies delivery done.
    #[must_use]
    pub fn with_auto_delivery_done(mut self, enabled: bool) -> Self {
        self.auto_delivery_done = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entisync_protocol::{EntityKind, LocalId};

    #[test]
    fn test_defaults() {
        let config = SyncConfig::new(Scope::items_in(LocalId(1)));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.transaction_mode, TransactionMode::Single);
        assert!(!config.streaming);
        assert!(config.auto_delivery_done);
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::new(Scope::all(EntityKind::Tag))
            .with_batch_size(0)
            .with_transaction_mode(TransactionMode::Multiple)
            .with_streaming(true)
            .with_auto_delivery_done(false);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.transaction_mode, TransactionMode::Multiple);
        assert!(config.streaming);
        assert!(!config.auto_delivery_done);
    }
}
