//! Error types for dispatch, connections and the broker.

use shv_chainpack::{ChainPackError, ErrorCode, RpcError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for `shv-iot`.
#[derive(Debug, Error)]
pub enum ShvError {
    // Dispatch errors, answered with an error response
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    #[error("Method '{method}' not found on path '{path}'")]
    MethodNotFound { path: String, method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    // Call outcomes
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request aborted")]
    Abort,

    #[error("Remote error {0}")]
    Remote(RpcError),

    #[error("Send queue of connection {connection} is full")]
    SendQueueFull { connection: i64 },

    #[error("Message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    // Session errors
    #[error("Login failed: {message}")]
    LoginFailed { message: String },

    #[error("Frame error: {message}")]
    Frame { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    ChainPack(#[from] ChainPackError),

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for `shv-iot` operations.
pub type Result<T> = std::result::Result<T, ShvError>;

impl From<std::io::Error> for ShvError {
    fn from(err: std::io::Error) -> Self {
        ShvError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ShvError {
    fn from(err: serde_json::Error) -> Self {
        ShvError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RpcError> for ShvError {
    fn from(err: RpcError) -> Self {
        ShvError::Remote(err)
    }
}

impl ShvError {
    pub fn path_not_found(path: impl Into<String>) -> Self {
        ShvError::PathNotFound { path: path.into() }
    }

    pub fn method_not_found(path: impl Into<String>, method: impl Into<String>) -> Self {
        ShvError::MethodNotFound {
            path: path.into(),
            method: method.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        ShvError::InvalidParams {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        ShvError::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ShvError::Internal {
            message: message.into(),
        }
    }

    /// RPC error code this error is reported with.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ShvError::PathNotFound { .. } => ErrorCode::PathNotFound,
            ShvError::MethodNotFound { .. } => ErrorCode::MethodNotFound,
            ShvError::InvalidParams { .. } => ErrorCode::InvalidParams,
            ShvError::PermissionDenied { .. } | ShvError::LoginFailed { .. } => {
                ErrorCode::PermissionDenied
            }
            ShvError::ConnectionClosed => ErrorCode::ConnectionClosed,
            ShvError::Timeout(_) => ErrorCode::Timeout,
            ShvError::Abort => ErrorCode::Abort,
            ShvError::Remote(err) => err.code,
            ShvError::ChainPack(ChainPackError::MalformedMessage { .. }) => {
                ErrorCode::InvalidRequest
            }
            ShvError::ChainPack(ChainPackError::MalformedData { .. }) => ErrorCode::ParseError,

            // Everything else is internal
            _ => ErrorCode::InternalError,
        }
    }

    /// Error record sent to the peer in an error response.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            ShvError::Remote(err) => err.clone(),
            other => RpcError::new(other.error_code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ShvError::path_not_found("a/b").error_code(),
            ErrorCode::PathNotFound
        );
        assert_eq!(
            ShvError::Timeout(Duration::from_secs(1)).error_code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            ShvError::Config {
                message: "x".to_string()
            }
            .error_code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_remote_error_passes_through() {
        let remote = RpcError::new(ErrorCode::User(40), "device busy");
        let err = ShvError::from(remote.clone());
        assert_eq!(err.to_rpc_error(), remote);
        assert_eq!(err.error_code(), ErrorCode::User(40));
    }

    #[test]
    fn test_rpc_error_message() {
        let err = ShvError::method_not_found("sensors", "reset").to_rpc_error();
        assert_eq!(err.code, ErrorCode::MethodNotFound);
        assert!(err.message.contains("reset"));
    }
}
