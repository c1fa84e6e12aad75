//! Loopback connection to a [`MemoryStore`].

use crate::store::{MemoryStore, StoreReply};
use entisync_core::{CoreError, CoreResult};
use entisync_job::Connection;
use entisync_protocol::{Command, Inbound, Tag};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A [`Connection`] answered by a [`MemoryStore`] on the same thread.
///
/// Responses are queued on the inbound channel while the command is
/// written, and reach the session on a later tick of the event loop.
#[derive(Debug)]
pub struct LoopbackConnection {
    store: MemoryStore,
    inbound: Option<UnboundedSender<Inbound>>,
}

impl LoopbackConnection {
    /// Creates a connection to `store`.
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            inbound: None,
        }
    }

    /// Returns the store this connection talks to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl Connection for LoopbackConnection {
    fn open(&mut self) -> CoreResult<UnboundedReceiver<Inbound>> {
        let hello = self
            .store
            .accept()
            .ok_or_else(|| CoreError::connection_failed("store refused the connection"))?;
        let (sender, receiver) = unbounded_channel();
        sender
            .send(hello)
            .map_err(|e| CoreError::connection_failed(e.to_string()))?;
        self.inbound = Some(sender);
        Ok(receiver)
    }

    fn send(&mut self, tag: Tag, command: &Command) -> CoreResult<()> {
        let Some(inbound) = self.inbound.as_ref() else {
            return Err(CoreError::connection_failed("not connected"));
        };

        for message in self.store.take_injected() {
            inbound
                .send(message)
                .map_err(|e| CoreError::connection_failed(e.to_string()))?;
        }

        match self.store.process(command) {
            StoreReply::Respond(responses) => {
                for response in responses {
                    inbound
                        .send(Inbound::Response { tag, response })
                        .map_err(|e| CoreError::connection_failed(e.to_string()))?;
                }
                Ok(())
            }
            StoreReply::Close(reason) => {
                if let Err(error) = inbound.send(Inbound::Closed { reason }) {
                    tracing::debug!(%error, "session stopped listening before close");
                }
                self.inbound = None;
                self.store.disconnect();
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        if self.inbound.take().is_some() {
            self.store.disconnect();
        }
    }
}
