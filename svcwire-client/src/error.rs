//! Client error types.

use svcwire_protocol::{ErrorCode, ErrorResponse, Value};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] svcwire_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("duplicate request id: {0}")]
    DuplicateRequestId(u64),

    #[error("listener not found: {0}")]
    ListenerNotFound(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("{name} [{code}]: {message}")]
    Remote {
        code: String,
        name: String,
        message: String,
        stack: Option<String>,
        detail: Option<Value>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Remote { .. } => self.code().is_some_and(|c| c.is_retryable()),
            _ => false,
        }
    }

    /// Well-known code of a remote error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote { code, .. } => ErrorCode::from_code(code),
            ClientError::Timeout => Some(ErrorCode::Timeout),
            ClientError::ConnectionClosed => Some(ErrorCode::ConnectionClosed),
            _ => None,
        }
    }
}

impl From<ErrorResponse> for ClientError {
    fn from(err: ErrorResponse) -> Self {
        ClientError::Remote {
            code: err.code,
            name: err.name,
            message: err.message,
            stack: err.stack,
            detail: err.detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_from_response() {
        let err: ClientError = ErrorResponse::new(ErrorCode::Forbidden, "admin only")
            .with_name("PermissionError")
            .for_request(3)
            .into();
        assert_eq!(err.code(), Some(ErrorCode::Forbidden));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "PermissionError [FORBIDDEN]: admin only");
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());

        let custom: ClientError = ErrorResponse::new(ErrorCode::BusinessError, "no stock")
            .with_code("OUT_OF_STOCK")
            .into();
        assert_eq!(custom.code(), None);
        assert!(!custom.is_retryable());
    }
}
