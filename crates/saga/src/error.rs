//! Saga error types.

use common::{SagaId, SagaState};
use envelope::{DecodeError, EventType};
use event_bus::BusError;
use saga_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A non-terminal saga already exists for this reference.
    #[error("Active {saga_type} saga already exists for reference '{reference_id}'")]
    DuplicateReferenceId {
        saga_type: String,
        reference_id: String,
    },

    /// The event does not fit the saga's current state.
    #[error("Unexpected {event_type} for step '{step_name}' on saga {saga_id} in state {state}: {reason}")]
    UnexpectedTransition {
        saga_id: SagaId,
        state: SagaState,
        event_type: EventType,
        step_name: String,
        reason: String,
    },

    /// A participant's local action failed.
    #[error("Step '{step}' failed: {reason}")]
    ParticipantActionFailed { step: String, reason: String },

    /// The saga record changed underneath an update.
    #[error("Saga {0} was modified concurrently")]
    StoreConflict(SagaId),

    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A saga definition or handler registration is inconsistent.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The saga does not exist.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[source] StoreError),

    /// Event bus error.
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    /// Envelope or payload decoding error.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Shorthand for a participant failure.
    pub fn action_failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        SagaError::ParticipantActionFailed {
            step: step.into(),
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { saga_id, .. } => SagaError::StoreConflict(saga_id),
            StoreError::NotFound(saga_id) => SagaError::SagaNotFound(saga_id),
            StoreError::DuplicateReference {
                saga_type,
                reference_id,
            } => SagaError::DuplicateReferenceId {
                saga_type,
                reference_id,
            },
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
