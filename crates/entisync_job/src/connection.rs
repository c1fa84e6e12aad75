//! Connection abstraction.

use entisync_core::CoreResult;
use entisync_protocol::{Command, Inbound, Tag};
use tokio::sync::mpsc::UnboundedReceiver;

/// One logical request/response channel to the store.
///
/// This trait abstracts the transport, allowing for different
/// implementations (a socket with a wire codec, an in-memory loopback for
/// testing, etc.). A connection is opened lazily by its
/// [`Session`](crate::Session) and may be closed and reopened any number
/// of times.
pub trait Connection {
    /// Opens the channel.
    ///
    /// Returns the receiving end on which the connection delivers the
    /// store's greeting, tagged responses and close notifications. The
    /// channel ending counts as connection loss.
    fn open(&mut self) -> CoreResult<UnboundedReceiver<Inbound>>;

    /// Writes a tagged command.
    ///
    /// An error counts as connection loss.
    fn send(&mut self, tag: Tag, command: &Command) -> CoreResult<()>;

    /// Closes the channel. Closing a closed connection does nothing.
    fn close(&mut self);
}
