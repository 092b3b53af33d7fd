//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing, value decoding or
/// fragment reassembly.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'SVCW', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    #[error("invalid {tag} value: {reason}")]
    InvalidValue { tag: String, reason: String },

    #[error("message cannot be sent as a single frame: {0}")]
    Unframeable(&'static str),

    #[error("invalid split header: {0} bytes")]
    InvalidSplitHeader(usize),

    #[error("message size exceeds the limit: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u64 },

    #[error("fragment length mismatch: recorded {recorded}, got {got}")]
    LengthMismatch { recorded: u64, got: u64 },

    #[error("fragment gap: expected index {expected}, got {got}")]
    FragmentGap { expected: u32, got: u32 },

    #[error("fragment overflow: {received} bytes received for a {total} byte message")]
    FragmentOverflow { received: u64, total: u64 },

    #[error("reassembly budget exceeded: {attempted} bytes in flight (limit {limit})")]
    BudgetExceeded { attempted: u64, limit: u64 },
}

impl ProtocolError {
    /// Builds an [`ProtocolError::InvalidValue`] for the given type tag.
    pub fn invalid_value(tag: impl Into<String>, reason: impl fmt::Display) -> Self {
        ProtocolError::InvalidValue {
            tag: tag.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the wire error code that best describes this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedProtocol,
            ProtocolError::MessageTooLarge { .. }
            | ProtocolError::LengthMismatch { .. }
            | ProtocolError::FragmentGap { .. }
            | ProtocolError::FragmentOverflow { .. }
            | ProtocolError::BudgetExceeded { .. }
            | ProtocolError::InvalidSplitHeader(_) => ErrorCode::SplitFailed,
            ProtocolError::Io(_) => ErrorCode::InternalError,
            _ => ErrorCode::ProtocolError,
        }
    }
}

/// Stable error codes returned in error responses.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions. Business code may put its own code strings on the wire;
/// those simply do not map to a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    BadRequest,
    ProtocolError,
    SplitFailed,

    // Authentication errors
    Unauthorized,
    AuthFailed,
    Forbidden,

    // Dispatch errors
    NotFound,

    // Resource errors
    ResourceNotFound,
    ResourceError,
    UploadFailed,

    // Session errors
    Timeout,
    ConnectionClosed,

    // Application errors
    BusinessError,

    // System errors
    InternalError,
    RateLimited,
}

impl ErrorCode {
    const ALL: [ErrorCode; 16] = [
        ErrorCode::UnsupportedProtocol,
        ErrorCode::BadRequest,
        ErrorCode::ProtocolError,
        ErrorCode::SplitFailed,
        ErrorCode::Unauthorized,
        ErrorCode::AuthFailed,
        ErrorCode::Forbidden,
        ErrorCode::NotFound,
        ErrorCode::ResourceNotFound,
        ErrorCode::ResourceError,
        ErrorCode::UploadFailed,
        ErrorCode::Timeout,
        ErrorCode::ConnectionClosed,
        ErrorCode::BusinessError,
        ErrorCode::InternalError,
        ErrorCode::RateLimited,
    ];

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::RateLimited
                | ErrorCode::InternalError
                | ErrorCode::UploadFailed
        )
    }

    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::SplitFailed => "SPLIT_FAILED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::ResourceError => "RESOURCE_ERROR",
            ErrorCode::UploadFailed => "UPLOAD_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::BusinessError => "BUSINESS_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
        }
    }

    /// Parses a wire code string. Returns `None` for application-defined codes.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
