//! Lockstep Error Types

use thiserror::Error;

use crate::id::{ObjectId, Version};

/// Result type alias for Lockstep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Lockstep error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Replication errors
    #[error("Object already published as {0}")]
    AlreadyPublished(ObjectId),

    #[error("Object has not been published")]
    NotPublished,

    #[error("Unknown object identifier: {0}")]
    UnknownIdentifier(ObjectId),

    #[error("Authoritative source for {0} is gone")]
    SourceGone(ObjectId),

    #[error("Stale version {received} for {id} (mirror at {current})")]
    VersionRegression {
        id: ObjectId,
        received: Version,
        current: Version,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Frame errors
    #[error("Participant disconnected: {0}")]
    Disconnected(String),

    #[error("Frame {0} has not been acknowledged yet")]
    FramePending(u64),

    #[error("Only the authoring process may commit frames")]
    NotAuthoring,

    // Maintenance errors
    #[error("Caller is not the maintenance owner of {0}")]
    NotOwner(String),

    #[error("Maintenance owner of {scope} did not finish within {waited_ms}ms")]
    OwnerLivenessTimeout { scope: String, waited_ms: u64 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UnknownIdentifier(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error is a contract violation by the caller
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AlreadyPublished(_)
                | Error::NotPublished
                | Error::NotOwner(_)
                | Error::FramePending(_)
                | Error::NotAuthoring
        )
    }
}
