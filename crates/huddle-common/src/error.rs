//! Common error types for Huddle.

use thiserror::Error;

/// Result type alias using Huddle's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Huddle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Signaling channel failed or closed
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Local capture could not be acquired
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Peer-connection backend failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a media acquisition error from any displayable type.
    pub fn media(msg: impl std::fmt::Display) -> Self {
        Self::MediaAcquisition(msg.to_string())
    }

    /// Create a connection error from any displayable type.
    pub fn connection(msg: impl std::fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
