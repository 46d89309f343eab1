//! Error types for the rate limit filter.

use thiserror::Error;

/// Main error type for rate limit filter operations.
#[derive(Error, Debug)]
pub enum FilterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The surrounding filter chain drove the filter in a way it must not.
    ///
    /// This aborts processing of the offending request only.
    #[error("Filter protocol violation: {0}")]
    ProtocolViolation(String),

    /// The decision service call failed
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// Channel construction errors
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rate limit filter operations.
pub type Result<T> = std::result::Result<T, FilterError>;
