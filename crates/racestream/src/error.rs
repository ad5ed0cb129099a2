//! Error types for racestream.
//!
//! This module defines the crate-wide error type. Transport failures are
//! normally absorbed by the reconnect loop and only surface here when a
//! caller talks to the REST collaborators or the client has shut down.

use thiserror::Error;

/// The main error type for racestream operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Transport Errors ===
    /// An HTTP request could not be sent or its body could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus {
        /// Status code returned by the server.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The live stream ended or failed.
    #[error("stream for event '{event_id}' closed: {reason}")]
    StreamClosed {
        /// Event whose stream closed.
        event_id: String,
        /// Description of what went wrong.
        reason: String,
    },

    // === Client Errors ===
    /// The live client task is no longer running.
    #[error("live client is not running")]
    ClientClosed,

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for racestream operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a stream-closed error.
    #[must_use]
    pub fn stream_closed(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StreamClosed {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration validation error.
    #[must_use]
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Check if this error came from the network layer.
    ///
    /// Transport errors are retried by the connection manager rather than
    /// reported to the user.
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::HttpStatus { .. } | Self::StreamClosed { .. }
        )
    }

    /// Check if this error means the client task has gone away.
    #[must_use]
    pub fn is_client_closed(&self) -> bool {
        matches!(self, Self::ClientClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ClientClosed;
        assert_eq!(err.to_string(), "live client is not running");
    }

    #[test]
    fn test_stream_closed_display() {
        let err = Error::stream_closed("evt-42", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("evt-42"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_http_status_display() {
        let err = Error::HttpStatus {
            status: 503,
            url: "http://localhost:8000/api/v1/events".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("503"));
        assert!(msg.contains("/api/v1/events"));
    }

    #[test]
    fn test_is_transport_error() {
        assert!(Error::stream_closed("e", "eof").is_transport_error());
        assert!(Error::HttpStatus {
            status: 500,
            url: String::new()
        }
        .is_transport_error());
        assert!(!Error::ClientClosed.is_transport_error());
        assert!(!Error::config_validation("x").is_transport_error());
    }

    #[test]
    fn test_is_client_closed() {
        assert!(Error::ClientClosed.is_client_closed());
        assert!(!Error::stream_closed("e", "eof").is_client_closed());
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::config_validation("batch_interval_ms must be greater than 0");
        assert!(err.to_string().contains("batch_interval_ms"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }
}
