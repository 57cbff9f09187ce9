use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use envelope::{Envelope, EventType};

use crate::{Result, SagaId};

/// The semantic identity of an event: redeliveries share it even though
/// their correlation IDs differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub saga_id: SagaId,
    pub step_name: String,
    pub event_type: EventType,
}

impl IdempotencyKey {
    pub fn new(saga_id: SagaId, step_name: impl Into<String>, event_type: EventType) -> Self {
        Self {
            saga_id,
            step_name: step_name.into(),
            event_type,
        }
    }

    /// The key of an envelope.
    pub fn of(envelope: &Envelope) -> Self {
        Self::new(envelope.saga_id, envelope.step_name.clone(), envelope.event_type)
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.saga_id, self.step_name, self.event_type)
    }
}

/// Result of claiming an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First time this key was seen; the caller must apply the event.
    Applied,
    /// The event was already applied; the caller must skip it.
    AlreadyApplied,
}

/// Per-consumer record of events already applied.
///
/// Each consumer (orchestrator, every participant group) owns its own
/// tracker. Keys are kept for the whole life of a saga and only become
/// collectable a retention period after the saga is marked terminal.
#[async_trait]
pub trait IdempotencyTracker: Send + Sync {
    /// Returns true if the key has already been claimed.
    async fn is_applied(&self, key: &IdempotencyKey) -> Result<bool>;

    /// Atomically claims a key.
    async fn try_apply(&self, key: &IdempotencyKey) -> Result<ApplyOutcome>;

    /// Gives a claimed key back after the application that followed the claim
    /// was rejected, so a later redelivery is not mistaken for a duplicate.
    async fn release(&self, key: &IdempotencyKey) -> Result<()>;

    /// Records that a saga reached a terminal state.
    async fn mark_terminal(&self, saga_id: SagaId, at: DateTime<Utc>) -> Result<()>;

    /// Drops the keys of sagas that became terminal more than `retention`
    /// before `now`. Returns the number of keys removed.
    async fn collect_garbage(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize>;
}
