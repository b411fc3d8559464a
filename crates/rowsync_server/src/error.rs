//! Error types for the sync server.

use rowsync_core::CoreError;
use rowsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
///
/// Per-mutation failures are not errors at this level; they are reported
/// as rejected outcomes inside a successful push response.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The credential was missing or not recognized.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Unknown endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request or response body could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Startup declaration error.
    #[error("configuration error: {0}")]
    Configuration(#[from] CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::ProtocolMismatch(_)
                | ServerError::NotFound(_)
                | ServerError::Codec(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Codec(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotFound(_) => 404,
            ServerError::ProtocolMismatch(_) => 409,
            ServerError::Configuration(_) | ServerError::Internal(_) | ServerError::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::Codec(ProtocolError::Decode("x".into())).is_client_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::AuthenticationFailed("t".into()).status_code(), 401);
        assert_eq!(ServerError::NotFound("/x".into()).status_code(), 404);
        assert_eq!(
            ServerError::Configuration(CoreError::UnknownTable("t".into())).status_code(),
            500
        );
    }
}
