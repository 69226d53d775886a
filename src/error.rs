//! Error types for the Bouncer service.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::ratelimit::StoreError;

/// Main error type for Bouncer operations.
#[derive(Error, Debug)]
pub enum BouncerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A subject identifier was empty or malformed
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Gossip cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for BouncerError {
    fn from(e: ::config::ConfigError) -> Self {
        BouncerError::Config(e.to_string())
    }
}

/// Result type alias for Bouncer operations.
pub type Result<T> = std::result::Result<T, BouncerError>;
