//! Error types for the taskworker

use thiserror::Error;

/// Result type alias using the taskworker Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for taskworker operations
#[derive(Error, Debug)]
pub enum Error {
    /// A task was registered twice under the same namespace and name
    #[error("task {namespace}:{name} is already registered")]
    DuplicateTask { namespace: String, name: String },

    /// Activation parameters could not be decoded
    #[error("invalid task parameters: {0}")]
    InvalidParameters(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Malformed frame on the child pipe
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is fatal at startup
    pub fn is_startup_error(&self) -> bool {
        matches!(self, Error::DuplicateTask { .. } | Error::Configuration(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}
