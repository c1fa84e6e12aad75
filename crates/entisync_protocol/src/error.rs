//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while interpreting protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Unrecognized entity kind name.
    #[error("unknown entity kind: '{0}'")]
    UnknownEntityKind(String),

    /// A GID that is not a lowercase hex digest.
    #[error("invalid gid: '{0}'")]
    InvalidGid(String),
}
