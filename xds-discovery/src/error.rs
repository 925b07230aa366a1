//! Error types for the discovery client.

use thiserror::Error;

/// Error type for the discovery client.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to establish a connection to the management server.
    #[error("connection error: {0}")]
    Connection(String),

    /// The discovery stream terminated with a transport status.
    #[cfg(feature = "transport-tonic")]
    #[error("stream error: {0}")]
    Stream(tonic::Status),

    /// The discovery stream was closed by the peer.
    #[error("stream closed")]
    StreamClosed,

    /// A wire message could not be decoded.
    #[cfg(feature = "codegen-prost")]
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Input failed validation before it reached the wire.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for discovery client operations.
pub type Result<T> = std::result::Result<T, Error>;
