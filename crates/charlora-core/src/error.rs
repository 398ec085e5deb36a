//! Error types for the Charlora service.

use charlora_training::{JobId, RegistryError, TrainingError};
use thiserror::Error;

/// Core error type for service operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unparseable configuration file
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A well-formed submission that breaks a business rule
    #[error("{0}")]
    InvalidSubmission(String),

    /// A request missing fields or carrying values of the wrong type
    #[error("{0}")]
    MalformedRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, CoreError>;
