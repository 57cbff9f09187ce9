//! Saga lifecycle state.

use serde::{Deserialize, Serialize};

/// The state of a saga instance.
///
/// State transitions:
/// ```text
/// Initiated ──► StepInProgress ──┬──► Completed
///     │              ▲  │        │
///     │              └──┘        └──► Compensating ──► Failed
///     ├──────────────────────────────────► Completed   (single-step saga)
///     └──────────────────────────────────► Failed      (first step failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Saga was created and START was emitted; the first step is in flight.
    #[default]
    Initiated,

    /// A step after the first one is in flight.
    StepInProgress,

    /// The in-flight step reported completion and the saga has not advanced yet.
    StepCompleted,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// The saga failed, after compensation if any was needed (terminal state).
    Failed,
}

impl SagaState {
    /// Every state, in lifecycle order.
    pub const ALL: [SagaState; 6] = [
        SagaState::Initiated,
        SagaState::StepInProgress,
        SagaState::StepCompleted,
        SagaState::Compensating,
        SagaState::Completed,
        SagaState::Failed,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    /// Returns true while a forward step is awaiting its result.
    pub fn is_awaiting_step(&self) -> bool {
        matches!(
            self,
            SagaState::Initiated | SagaState::StepInProgress | SagaState::StepCompleted
        )
    }

    /// Returns the wire/storage name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Initiated => "INITIATED",
            SagaState::StepInProgress => "STEP_IN_PROGRESS",
            SagaState::StepCompleted => "STEP_COMPLETED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Completed => "COMPLETED",
            SagaState::Failed => "FAILED",
        }
    }

    /// Parses a state from its wire/storage name.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
