//! The saga state machine as a pure function.
//!
//! [`apply`] takes a record and an incoming step result and either mutates
//! the record into its next state, returning the envelopes to publish, or
//! rejects the event leaving the record untouched. It performs no I/O, so
//! persistence, publishing and idempotency are the orchestrator's business.
//!
//! ```text
//! INITIATED        + STEP_COMPLETED  -> STEP_IN_PROGRESS (STEP next) | COMPLETED
//! INITIATED        + FAILED          -> FAILED
//! STEP_IN_PROGRESS + STEP_COMPLETED  -> STEP_IN_PROGRESS (STEP next) | COMPLETED
//! STEP_IN_PROGRESS + FAILED          -> COMPENSATING (COMPENSATE last completed)
//! COMPENSATING     + COMPENSATED     -> COMPENSATING (COMPENSATE next) | FAILED
//! COMPLETED/FAILED + anything        -> discarded
//! ```

use chrono::{DateTime, Duration, Utc};
use common::{CorrelationId, SagaState};
use envelope::{Envelope, EventType};
use saga_store::SagaRecord;

use crate::definition::SagaDefinition;

/// Why an event was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The saga already finished; the event is logged and dropped.
    Terminal(SagaState),
    /// The event does not fit the current state.
    Unexpected(String),
}

/// Applies a step result to a saga record.
///
/// On success the record holds the new state and history, and the returned
/// envelopes must be published in order. On rejection the record is unchanged.
pub fn apply(
    record: &mut SagaRecord,
    definition: &SagaDefinition,
    event: &Envelope,
    now: DateTime<Utc>,
    step_timeout: Duration,
) -> Result<Vec<Envelope>, Rejection> {
    if record.is_terminal() {
        return Err(Rejection::Terminal(record.state));
    }

    match (record.state, event.event_type) {
        (state, EventType::StepCompleted) if state.is_awaiting_step() => {
            expect_in_flight(record, definition, event)?;
            Ok(complete_step(record, definition, event, now, step_timeout))
        }
        (state, EventType::Failed) if state.is_awaiting_step() => {
            expect_in_flight(record, definition, event)?;
            Ok(fail_step(record, event, now))
        }
        (SagaState::Compensating, EventType::Compensated) => {
            match record.pending_compensations.first() {
                Some(head) if *head == event.step_name => {}
                Some(head) => {
                    return Err(Rejection::Unexpected(format!(
                        "compensation of '{head}' is pending, not '{}'",
                        event.step_name
                    )));
                }
                None => {
                    return Err(Rejection::Unexpected(
                        "no compensation is pending".to_string(),
                    ));
                }
            }
            Ok(complete_compensation(record, event, now))
        }
        (state, event_type) => Err(Rejection::Unexpected(format!(
            "{event_type} is not accepted in state {state}"
        ))),
    }
}

fn expect_in_flight(
    record: &SagaRecord,
    definition: &SagaDefinition,
    event: &Envelope,
) -> Result<(), Rejection> {
    match definition.step(record.current_step_index) {
        Some(step) if step == event.step_name => Ok(()),
        Some(step) => Err(Rejection::Unexpected(format!(
            "step '{step}' is in flight, not '{}'",
            event.step_name
        ))),
        None => Err(Rejection::Unexpected(format!(
            "step index {} is outside the {} definition",
            record.current_step_index,
            definition.saga_type()
        ))),
    }
}

fn complete_step(
    record: &mut SagaRecord,
    definition: &SagaDefinition,
    event: &Envelope,
    now: DateTime<Utc>,
    step_timeout: Duration,
) -> Vec<Envelope> {
    let step = event.step_name.clone();
    record.record_history(EventType::StepCompleted, step.as_str(), now);
    record.completed_steps.push(step.clone());
    record
        .step_outputs
        .insert(step, event.payload.clone());

    let next_index = record.current_step_index + 1;
    let outbound = match definition.step(next_index) {
        Some(next) => {
            record.current_step_index = next_index;
            record.state = SagaState::StepInProgress;
            record.step_deadline = Some(now + step_timeout);
            emit(record, EventType::Step, next, event.payload.clone(), now)
        }
        None => {
            record.state = SagaState::Completed;
            record.step_deadline = None;
            emit(record, EventType::Completed, "", event.payload.clone(), now)
        }
    };
    vec![outbound]
}

fn fail_step(record: &mut SagaRecord, event: &Envelope, now: DateTime<Utc>) -> Vec<Envelope> {
    record.record_history(EventType::Failed, event.step_name.as_str(), now);
    record.failure_payload = Some(event.payload.clone());
    record.step_deadline = None;

    if record.completed_steps.is_empty() {
        record.state = SagaState::Failed;
        return vec![emit(record, EventType::Failed, "", event.payload.clone(), now)];
    }

    record.state = SagaState::Compensating;
    record.pending_compensations = record.completed_steps.iter().rev().cloned().collect();
    vec![compensate_head(record, now)]
}

fn complete_compensation(
    record: &mut SagaRecord,
    event: &Envelope,
    now: DateTime<Utc>,
) -> Vec<Envelope> {
    record.record_history(EventType::Compensated, event.step_name.as_str(), now);
    record.pending_compensations.remove(0);

    if !record.pending_compensations.is_empty() {
        return vec![compensate_head(record, now)];
    }

    record.state = SagaState::Failed;
    let failure = record.failure_payload.clone().unwrap_or_default();
    vec![emit(record, EventType::Failed, "", failure, now)]
}

fn compensate_head(record: &mut SagaRecord, now: DateTime<Utc>) -> Envelope {
    let step = record.pending_compensations[0].clone();
    let output = record.step_outputs.get(&step).cloned().unwrap_or_default();
    emit(record, EventType::Compensate, &step, output, now)
}

/// Builds an outbound envelope and records it in the history.
fn emit(
    record: &mut SagaRecord,
    event_type: EventType,
    step_name: &str,
    payload: Vec<u8>,
    now: DateTime<Utc>,
) -> Envelope {
    record.record_history(event_type, step_name, now);
    Envelope {
        saga_id: record.saga_id,
        saga_type: record.saga_type.clone(),
        event_type,
        step_name: step_name.to_string(),
        payload,
        correlation_id: CorrelationId::new(),
        timestamp: now,
    }
}
