//! Server error types.

use svcwire_protocol::{ErrorCode, ErrorResponse};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] svcwire_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service error: {0}")]
    Service(#[from] crate::service::ServiceError),

    #[error("resource error: {0}")]
    Resource(#[from] crate::resource::ResourceError),

    #[error("upload error: {0}")]
    Upload(#[from] crate::upload::UploadError),

    #[error("session not authenticated")]
    NotAuthenticated,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("listener key already registered: {0}")]
    DuplicateListener(String),

    #[error("listener not found: {0}")]
    ListenerNotFound(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("too many connections")]
    TooManyConnections,

}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(e) => e.error_code(),
            ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::Service(e) => e.error_code(),
            ServerError::Resource(e) => e.error_code(),
            ServerError::Upload(_) => ErrorCode::UploadFailed,
            ServerError::NotAuthenticated => ErrorCode::Unauthorized,
            ServerError::AuthFailed(_) => ErrorCode::AuthFailed,
            ServerError::UnsupportedVersion(_) => ErrorCode::UnsupportedProtocol,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::DuplicateListener(_) => ErrorCode::BadRequest,
            ServerError::ListenerNotFound(_) => ErrorCode::NotFound,
            ServerError::HandshakeTimeout => ErrorCode::Timeout,
            ServerError::TooManyConnections => ErrorCode::RateLimited,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    /// Builds the wire error for this failure.
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            ServerError::Service(e) => e.to_response(),
            _ => ErrorResponse::new(self.error_code(), self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ServerError::NotAuthenticated.error_code(), ErrorCode::Unauthorized);
        assert_eq!(
            ServerError::DuplicateListener("k1".into()).error_code(),
            ErrorCode::BadRequest
        );
        assert_eq!(
            ServerError::UnsupportedVersion(9).to_response().code,
            "UNSUPPORTED_PROTOCOL"
        );
        assert!(ServerError::TooManyConnections.is_retryable());
        assert!(!ServerError::AuthFailed("bad".into()).is_retryable());
    }
}
