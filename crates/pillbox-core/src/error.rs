//! Error types for the core crate.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage collaborator failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Compartment id outside 0..=9 or not a number.
    #[error("Invalid compartment: {0}")]
    InvalidCompartment(String),

    /// No active schedule for the medication.
    #[error("No active schedule for medication {medication_id}")]
    NoSchedule { medication_id: String },

    /// Notifier collaborator failure.
    #[error("Notification error: {0}")]
    Notification(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
