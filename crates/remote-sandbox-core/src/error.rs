//! Error taxonomy shared by every public operation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias used across the public boundary.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Stable error code carried by every [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad configuration (missing field, missing credentials, key file not found).
    ValidationError,
    /// Operation attempted before a successful connect.
    NotConnected,
    /// Transport connect failure, timeout, or connection-level error.
    ConnectionError,
    /// A shell-level or pre-build command exited non-zero.
    CommandError,
    /// File upload failure.
    UploadError,
    /// File download failure.
    DownloadError,
    /// Exec failure or a decoded remote failure.
    ExecutionError,
    /// Malformed envelope not otherwise classified.
    ParseError,
    /// Catch-all.
    UnknownError,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::CommandError => "COMMAND_ERROR",
            Self::UploadError => "UPLOAD_ERROR",
            Self::DownloadError => "DOWNLOAD_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error representation that crosses the public boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Stable classification.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional diagnostics (raw command output, remote stack, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RemoteError {
    /// Create an error without details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    #[must_use]
    pub fn not_connected() -> Self {
        Self::new(
            ErrorCode::NotConnected,
            "Not connected. Call connect() first.",
        )
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionError, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CommandError, message)
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UploadError, message)
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DownloadError, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnknownError, message)
    }

    /// Whether this error carries the given code.
    #[must_use]
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::NotConnected).unwrap();
        assert_eq!(json, "\"NOT_CONNECTED\"");
        assert_eq!(ErrorCode::ExecutionError.to_string(), "EXECUTION_ERROR");
    }

    #[test]
    fn test_display_includes_code() {
        let err = RemoteError::execution("bad input");
        assert_eq!(err.to_string(), "EXECUTION_ERROR: bad input");
        assert!(err.is(ErrorCode::ExecutionError));
    }

    #[test]
    fn test_details_are_skipped_when_absent() {
        let json = serde_json::to_value(RemoteError::upload("nope")).unwrap();
        assert!(json.get("details").is_none());

        let with = RemoteError::command("exit 2").with_details(serde_json::json!({ "code": 2 }));
        assert_eq!(with.details.unwrap()["code"], 2);
    }
}
