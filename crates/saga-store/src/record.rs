use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use envelope::{Envelope, EventType};
use serde::{Deserialize, Serialize};

use crate::{SagaId, SagaState};

/// Version number of a saga record, used for compare-and-set updates.
///
/// A freshly inserted record is at version 1; every successful update
/// increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The version of a newly inserted record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a saga's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event_type: EventType,
    pub step_name: String,
    pub timestamp: DateTime<Utc>,
}

/// The durable record of a saga instance.
///
/// Only the orchestrator mutates records. Once `state` is terminal the record
/// is frozen apart from draining its outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub reference_id: String,
    pub state: SagaState,

    /// Index into the saga definition of the step in flight (or last run).
    pub current_step_index: usize,

    /// Start payload, forwarded to the first step.
    pub payload: Vec<u8>,

    /// Steps that reported STEP_COMPLETED, in completion order.
    pub completed_steps: Vec<String>,

    /// Output of each completed step.
    pub step_outputs: BTreeMap<String, Vec<u8>>,

    /// Steps still to be compensated, next first.
    pub pending_compensations: Vec<String>,

    /// Payload of the FAILED that started compensation.
    pub failure_payload: Option<Vec<u8>>,

    pub history: Vec<HistoryEntry>,

    /// Envelopes persisted with a transition but not yet confirmed published.
    pub outbox: Vec<Envelope>,

    /// When the in-flight forward step times out.
    pub step_deadline: Option<DateTime<Utc>>,

    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a record in the INITIATED state.
    pub fn new(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        reference_id: impl Into<String>,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            reference_id: reference_id.into(),
            state: SagaState::Initiated,
            current_step_index: 0,
            payload,
            completed_steps: Vec::new(),
            step_outputs: BTreeMap::new(),
            pending_compensations: Vec::new(),
            failure_payload: None,
            history: Vec::new(),
            outbox: Vec::new(),
            step_deadline: None,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the saga has reached COMPLETED or FAILED.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if the saga still has work to do or envelopes to publish.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal() || !self.outbox.is_empty()
    }

    /// Appends a history entry.
    pub fn record_history(
        &mut self,
        event_type: EventType,
        step_name: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        self.history.push(HistoryEntry {
            event_type,
            step_name: step_name.into(),
            timestamp: at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(Version::first() < Version::first().next());
        assert_eq!(Version::new(4).next().as_i64(), 5);
    }

    #[test]
    fn new_record_is_initiated() {
        let record = SagaRecord::new(SagaId::new(), "ACCOUNT_CREATION", "ref-1", vec![], Utc::now());
        assert_eq!(record.state, SagaState::Initiated);
        assert_eq!(record.version, Version::first());
        assert!(record.is_in_flight());
        assert!(!record.is_terminal());
    }

    #[test]
    fn terminal_record_with_outbox_is_still_in_flight() {
        let mut record =
            SagaRecord::new(SagaId::new(), "ACCOUNT_CREATION", "ref-1", vec![], Utc::now());
        record.state = SagaState::Completed;
        assert!(!record.is_in_flight());

        record.outbox.push(
            Envelope::builder()
                .saga_id(record.saga_id)
                .saga_type("ACCOUNT_CREATION")
                .event_type(EventType::Completed)
                .build(),
        );
        assert!(record.is_in_flight());
    }

    #[test]
    fn history_is_appended_in_order() {
        let mut record = SagaRecord::new(SagaId::new(), "PAYMENT_TRANSFER", "r", vec![], Utc::now());
        record.record_history(EventType::Start, "", Utc::now());
        record.record_history(EventType::StepCompleted, "initiate_payment", Utc::now());

        let types: Vec<_> = record.history.iter().map(|h| h.event_type).collect();
        assert_eq!(types, vec![EventType::Start, EventType::StepCompleted]);
    }
}
