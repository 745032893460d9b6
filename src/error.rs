//! Error types for Convoy

use thiserror::Error;

/// Result type for Convoy operations
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Convoy error types
#[derive(Error, Debug)]
pub enum ConvoyError {
    /// Malformed input: bad YAML, bad interpolation, invalid port or volume
    /// specs, dependency cycles, unsupported drivers.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced entity does not exist: compose file, service, external
    /// network or volume, image, container.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A create collided with an existing entity of the same ID.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A dependency wait or health wait exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Build process failure or an unexpected runtime error.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl ConvoyError {
    /// True when the error denotes a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConvoyError::NotFound(_))
    }

    /// True when the error denotes an ID collision.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ConvoyError::AlreadyExists(_))
    }
}
