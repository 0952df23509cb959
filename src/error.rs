//! Unified error types for the fan-out proxy.
//!
//! All errors are represented by the `ProxyError` enum which can be converted
//! to gRPC status codes where they cross the wire.

use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client violated the proxy stream protocol; the session is torn down.
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// No method descriptor is registered under the given name.
    #[error("Method '{name}' is not registered")]
    UnknownMethod { name: String },

    /// A frame referenced a stream id that is not in the stream set.
    #[error("No open stream with id {id}")]
    StreamNotFound { id: u64 },

    /// Invalid configuration value.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The backend target could not be reached.
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// Transport failure on the client stream.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// I/O error.
    #[error("I/O error: {message}")]
    IoError { message: String },

    /// Internal error with underlying cause.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Get a short error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::UnknownMethod { .. } => "UNKNOWN_METHOD",
            Self::StreamNotFound { .. } => "STREAM_NOT_FOUND",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::IoError { .. } => "IO_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Conversions from standard error types
// ============================================================================

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
        }
    }
}

impl From<tonic::transport::Error> for ProxyError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// gRPC Status conversion
// ============================================================================

impl From<ProxyError> for tonic::Status {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::ProtocolViolation { .. } => tonic::Status::invalid_argument(message),
            ProxyError::UnknownMethod { .. } => tonic::Status::unimplemented(message),
            ProxyError::StreamNotFound { .. } => tonic::Status::invalid_argument(message),
            ProxyError::InvalidConfig { .. } => tonic::Status::invalid_argument(message),
            ProxyError::BackendUnavailable { .. } => tonic::Status::unavailable(message),
            ProxyError::Transport { .. } => tonic::Status::unavailable(message),
            ProxyError::IoError { .. } | ProxyError::Internal { .. } => {
                tonic::Status::internal(message)
            }
        }
    }
}

// ============================================================================
// Result type alias
// ============================================================================

/// Result type alias using ProxyError.
pub type ProxyResult<T> = Result<T, ProxyError>;
