//! Error types for galileo

use thiserror::Error;

/// Main error type for galileo operations
#[derive(Error, Debug)]
pub enum GalileoError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no candidate workers for placement")]
    NoCandidate,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancellation could not be committed: {0}")]
    Cancel(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("event bus shut down")]
    Shutdown,

    #[error("substrate error: {0}")]
    Substrate(#[from] crate::substrate::SubstrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GalileoError {
    /// True for errors that mean the coordination substrate is unreachable.
    /// Daemons exit non-zero on these instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GalileoError::Fatal(_)
                | GalileoError::Substrate(crate::substrate::SubstrateError::Connection(_))
        )
    }
}

/// Convenience result type used throughout the crate
pub type Result<T> = std::result::Result<T, GalileoError>;
