//! Shared types for the saga orchestration workspace.

pub mod state;
pub mod types;

pub use state::SagaState;
pub use types::{CorrelationId, SagaId};
