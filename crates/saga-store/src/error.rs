use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record changed since it was read.
    #[error("Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    Conflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// A non-terminal saga already exists for this reference.
    #[error("Active {saga_type} saga already exists for reference '{reference_id}'")]
    DuplicateReference {
        saga_type: String,
        reference_id: String,
    },

    /// A saga with this ID was already inserted.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The saga was not found.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A stored row could not be turned back into a record.
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
