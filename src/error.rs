//! Error types for taskbroker.

use std::time::Duration;

use uuid::Uuid;

use crate::task::TaskState;

/// Top-level error type for the broker core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Storage-related errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} already exists")]
    DuplicateId { id: Uuid },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskState,
        to: TaskState,
    },

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Broker observation and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Wait for task {id} timed out after {timeout:?}")]
    WaitTimeout { id: Uuid, timeout: Duration },

    #[error("Broker is shutting down")]
    ShuttingDown,
}

/// Result type alias for the broker core.
pub type Result<T> = std::result::Result<T, Error>;
