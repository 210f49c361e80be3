//! Error types for boomer-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, fatal before any execution unit starts
    #[error("configuration error: {0}")]
    Config(String),

    /// Unparseable ramp-up rate specification
    #[error("invalid rate spec: {0}")]
    RateSpec(String),

    /// Control-plane transport failure (connect, send, receive)
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected control-plane message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Runner lifecycle error
    #[error("runner error: {0}")]
    Runner(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding error
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Transport error from any displayable cause
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
