//! Error types for the value model, codecs and message layer.

use thiserror::Error;

/// Main error type for `shv-chainpack`.
#[derive(Debug, Error)]
pub enum ChainPackError {
    // Codec errors
    #[error("Malformed data at byte {offset}: {message}")]
    MalformedData { message: String, offset: usize },

    // Registry errors
    #[error(
        "Meta type ({namespace_id}, {type_id}) is already registered as '{existing}', \
         refusing conflicting descriptor '{requested}'"
    )]
    TypeRegistrationConflict {
        namespace_id: i64,
        type_id: i64,
        existing: String,
        requested: String,
    },

    // Message layer errors
    #[error("Malformed RPC message: {message}")]
    MalformedMessage { message: String },

    // Transport-level errors bubbling up through streaming readers
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for `shv-chainpack` operations.
pub type Result<T> = std::result::Result<T, ChainPackError>;

impl From<std::io::Error> for ChainPackError {
    fn from(err: std::io::Error) -> Self {
        ChainPackError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ChainPackError {
    fn from(err: serde_json::Error) -> Self {
        ChainPackError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ChainPackError {
    /// Create a malformed-data error at the given input position.
    pub fn malformed(message: impl Into<String>, offset: usize) -> Self {
        ChainPackError::MalformedData {
            message: message.into(),
            offset,
        }
    }

    /// Create a malformed-message error.
    pub fn malformed_message(message: impl Into<String>) -> Self {
        ChainPackError::MalformedMessage {
            message: message.into(),
        }
    }

    /// True for errors caused by the content of the input rather than the transport.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ChainPackError::MalformedData { .. }
                | ChainPackError::MalformedMessage { .. }
                | ChainPackError::Json { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_display() {
        let err = ChainPackError::malformed("unexpected end of data", 7);
        assert_eq!(
            err.to_string(),
            "Malformed data at byte 7: unexpected end of data"
        );
        assert!(err.is_malformed());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ChainPackError = io.into();
        assert!(matches!(err, ChainPackError::Io { .. }));
        assert!(!err.is_malformed());
    }
}
