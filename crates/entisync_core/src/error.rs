//! Error types shared by tasks, jobs and the sync engine.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// First numeric code of the range reserved for higher-level error kinds.
pub const USER_DEFINED_ERROR_BASE: i32 = 100;

/// Errors surfaced by tasks and jobs.
///
/// Every variant maps to a stable numeric [`code`](CoreError::code) so that
/// callers (and UIs) can branch on the kind without matching on text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The connection to the store could not be established or was lost.
    #[error("cannot connect to the store: {0}")]
    ConnectionFailed(String),

    /// The store speaks a protocol version this client does not support.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolVersionMismatch {
        /// Version spoken by this client.
        local: u32,
        /// Version announced by the store.
        remote: u32,
    },

    /// The operation was aborted on purpose.
    #[error("user canceled operation")]
    UserCanceled,

    /// Any other failure, usually reported by the store.
    #[error("{0}")]
    Unknown(String),

    /// Error kinds defined by higher layers.
    #[error("{text} (code {code})")]
    UserDefined {
        /// Numeric code, at least [`USER_DEFINED_ERROR_BASE`].
        code: i32,
        /// Error text.
        text: String,
    },
}

impl CoreError {
    /// Creates a connection failure.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Creates an error with free-form text.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    /// Creates a higher-level error.
    ///
    /// Codes below [`USER_DEFINED_ERROR_BASE`] are shifted into the
    /// reserved range so they never collide with the built-in kinds.
    pub fn user_defined(code: i32, text: impl Into<String>) -> Self {
        let code = if code < USER_DEFINED_ERROR_BASE {
            USER_DEFINED_ERROR_BASE + code.max(0)
        } else {
            code
        };
        Self::UserDefined {
            code,
            text: text.into(),
        }
    }

    /// Returns the numeric error code.
    pub fn code(&self) -> i32 {
        match self {
            CoreError::ConnectionFailed(_) => 1,
            CoreError::ProtocolVersionMismatch { .. } => 2,
            CoreError::UserCanceled => 3,
            CoreError::Unknown(_) => 4,
            CoreError::UserDefined { code, .. } => *code,
        }
    }

    /// Returns the free-form error text.
    pub fn text(&self) -> String {
        match self {
            CoreError::ConnectionFailed(message) | CoreError::Unknown(message) => message.clone(),
            CoreError::UserDefined { text, .. } => text.clone(),
            other => other.to_string(),
        }
    }

    /// Returns true if retrying on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ConnectionFailed(_))
    }

    /// Returns true for deliberate aborts, which callers usually do not
    /// report as failures.
    pub fn is_user_canceled(&self) -> bool {
        matches!(self, CoreError::UserCanceled)
    }
}
