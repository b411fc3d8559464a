//! Error types for the sync client.

use rowsync_core::CoreError;
use rowsync_protocol::{MutationError, ProtocolError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The mutation or query failed locally.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The server rejected a mutation.
    #[error("rejected by server: {0}")]
    Rejected(MutationError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server failed to process the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// The server refused the handshake.
    #[error("handshake refused: {0}")]
    HandshakeRefused(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Persisted cache could not be read or written.
    #[error("cache storage error: {0}")]
    Storage(String),

    /// The client was torn down before the mutation was confirmed.
    #[error("client torn down")]
    TornDown,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Timeout | ClientError::ServerError(_) => true,
            _ => false,
        }
    }

    /// The local core error, if this is one.
    pub fn core(&self) -> Option<&CoreError> {
        match self {
            ClientError::Core(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::ErrorKind;

    #[test]
    fn retryable_errors() {
        assert!(ClientError::transport_retryable("connection lost").is_retryable());
        assert!(!ClientError::transport_fatal("invalid certificate").is_retryable());
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ServerError("internal error".into()).is_retryable());
        assert!(!ClientError::TornDown.is_retryable());
        assert!(!ClientError::Core(CoreError::NotAuthenticated).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ClientError::Rejected(MutationError::new(ErrorKind::PermissionDenied, "no"));
        assert!(err.to_string().contains("rejected"));
        assert_eq!(
            ClientError::Core(CoreError::NotAuthenticated).core(),
            Some(&CoreError::NotAuthenticated)
        );
    }
}
