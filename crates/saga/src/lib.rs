//! Saga orchestration for the account and payment workflows.
//!
//! The [`Orchestrator`] owns every saga's state machine. It persists each
//! transition together with the envelopes it emits, then publishes them on
//! the shared `saga-events` topic. Participants run behind a
//! [`ParticipantDispatcher`], one per consumer group, and answer every
//! command with a result envelope.
//!
//! The standard sagas are:
//! - `ACCOUNT_CREATION`: `create_account`
//! - `PAYMENT_TRANSFER`: `initiate_payment`, `update_balances`
//!
//! If a step fails, the steps completed before it are compensated in
//! reverse order and the saga ends FAILED.

pub mod definition;
pub mod error;
pub mod orchestrator;
pub mod participant;
pub mod participants;
pub mod timeout;
pub mod transition;

pub use definition::{SagaDefinition, SagaRegistry};
pub use error::{Result, SagaError};
pub use orchestrator::{HandleOutcome, Orchestrator, OrchestratorConfig, RecoveryReport};
pub use participant::{
    DispatchOutcome, HandlerRegistry, ParticipantDispatcher, Route, SagaObserver, StepFailure,
    StepHandler,
};
pub use timeout::DeadlineTracker;

/// Consumer group of the orchestrator.
pub const ORCHESTRATOR_GROUP: &str = "saga-orchestrator";

/// Consumer group of the account service.
pub const ACCOUNT_SERVICE_GROUP: &str = "account-service";

/// Consumer group of the payment service.
pub const PAYMENT_SERVICE_GROUP: &str = "payment-service";

/// Consumer group of the notification service.
pub const NOTIFICATION_SERVICE_GROUP: &str = "notification-service";
