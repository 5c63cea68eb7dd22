//! Error types for Conduit.
//!
//! A single error enum covers endpoint setup, framing, backend calls and the
//! client helpers. Connection-level failures never escape the dispatcher; they
//! are logged and turned into session teardown.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Conduit library.
#[derive(Debug, Error)]
pub enum ConduitError {
    // File system and socket errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Endpoint errors
    #[error("Endpoint error: {message}")]
    Endpoint { message: String },

    #[error("Another server is already listening on {path:?}")]
    AlreadyRunning { path: PathBuf },

    #[error("Connection authorization failed for {path:?}: {message}")]
    Authorization { path: PathBuf, message: String },

    // Framing errors
    #[error("Frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("No backend registered for {id:?}")]
    UnknownBackend { id: String },

    // Backend errors
    #[error("Backend {backend} failed: {message}")]
    Backend { backend: String, message: String },

    #[error("Backend {backend} did not answer within {elapsed:?}")]
    BackendTimeout { backend: String, elapsed: Duration },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        ConduitError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ConduitError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ConduitError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a backend failure for the named backend.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        ConduitError::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable tag, used in structured error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            ConduitError::Io { .. } => "io",
            ConduitError::Json { .. } => "parse_error",
            ConduitError::Endpoint { .. }
            | ConduitError::AlreadyRunning { .. }
            | ConduitError::Authorization { .. } => "endpoint",
            ConduitError::FrameTooLarge { .. } => "frame_too_large",
            ConduitError::ConnectionClosed => "connection_closed",
            ConduitError::Protocol { .. } => "protocol_error",
            ConduitError::UnknownBackend { .. } => "unknown_backend",
            ConduitError::Backend { .. } => "backend_error",
            ConduitError::BackendTimeout { .. } | ConduitError::Timeout(_) => "timeout",
            ConduitError::Config { .. } => "config",
            ConduitError::Other(_) => "internal",
        }
    }

    /// Whether this error means the peer (or our side) is gone for good.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ConduitError::Io { .. } | ConduitError::FrameTooLarge { .. } | ConduitError::ConnectionClosed
        )
    }
}
