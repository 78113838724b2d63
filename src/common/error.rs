//! Error types for shardmesh

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // === Topology Errors ===
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Topology validation failed: {0}")]
    Validation(String),

    #[error("Topology drift: {0}")]
    TopologyDrift(String),

    #[error("Quorum risk: {0}")]
    QuorumRisk(String),

    // === Coordination Store Errors ===
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Cache error: {0}")]
    Cache(String),

    // === Redistribution Errors ===
    #[error("Redistribution error: {0}")]
    Redist(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Timeout(_))
    }

    /// Errors an operator must fix in the input before trying again.
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Validation(_) | Error::QuorumRisk(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
