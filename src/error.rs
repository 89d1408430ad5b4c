//! Error types for the runtime
//!
//! Capacity refusals and double acknowledgements are expected conditions and
//! are reported as `false` by the components that hit them. The variants
//! here cover everything callers have to distinguish and act on.

use thiserror::Error;

/// Shared result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A bounded structure refused new work
    #[error("{what} is full (capacity {capacity})")]
    CapacityExceeded { what: &'static str, capacity: usize },

    /// An operation needs a collaborator that has not been installed
    #[error("{0} has not been initialized")]
    NotInitialized(&'static str),

    /// A service with this name is registered and currently running
    #[error("Service '{0}' is already registered and running")]
    AlreadyRegistered(String),

    /// The named service must be stopped before this operation
    #[error("Service '{0}' is running; stop it first")]
    ServiceRunning(String),

    #[error("Service '{0}' is not registered")]
    NotRegistered(String),

    #[error("Connection '{0}' is already registered")]
    ConnectionExists(String),

    /// A retry budget has been used up
    #[error("{what} exhausted after {attempts} attempts")]
    Exhausted { what: String, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid command payload: {0}")]
    Payload(#[from] edge_shared::PayloadError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RuntimeError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::CapacityExceeded { .. }
                | RuntimeError::Storage(_)
                | RuntimeError::Io(_)
                | RuntimeError::Task(_)
        )
    }
}
