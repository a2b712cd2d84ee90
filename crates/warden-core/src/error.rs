//! Lifecycle engine error types

use thiserror::Error;

/// Lifecycle engine errors
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource already in requested state: {0}")]
    AlreadyInState(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Ownership of {resource_id} cannot be proven: {reason}")]
    UnprovableOwnership { resource_id: String, reason: String },

    #[error("Malformed expirationDate on {resource_id}: {value:?}")]
    MalformedExpirationTag { resource_id: String, value: String },

    #[error("Timed out waiting for {target} after {attempts} attempts")]
    ConvergenceTimeout { target: String, attempts: u32 },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    /// The resource is already where the action would have put it
    pub fn is_idempotent_success(&self) -> bool {
        matches!(
            self,
            WardenError::ResourceNotFound(_) | WardenError::AlreadyInState(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WardenError::ConvergenceTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
