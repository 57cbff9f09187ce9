use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// The kind of message an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A saga was started; the first step should run.
    Start,
    /// A later step should run.
    Step,
    /// A participant finished its step.
    StepCompleted,
    /// A step failed. With an empty step name, the saga itself failed.
    Failed,
    /// A participant should undo a previously completed step.
    Compensate,
    /// A participant finished undoing its step.
    Compensated,
    /// The saga completed.
    Completed,
}

impl EventType {
    /// Every event type defined by the protocol.
    pub const ALL: [EventType; 7] = [
        EventType::Start,
        EventType::Step,
        EventType::StepCompleted,
        EventType::Failed,
        EventType::Compensate,
        EventType::Compensated,
        EventType::Completed,
    ];

    /// Returns the wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Step => "STEP",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::Failed => "FAILED",
            EventType::Compensate => "COMPENSATE",
            EventType::Compensated => "COMPENSATED",
            EventType::Completed => "COMPLETED",
        }
    }

    /// Parses an event type from its wire name.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable message exchanged over the saga bus.
///
/// The JSON field names are the wire contract. The payload is carried as a
/// base64 string and never interpreted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The saga this envelope belongs to.
    pub saga_id: SagaId,

    /// The saga definition (e.g. "ACCOUNT_CREATION").
    pub saga_type: String,

    /// What happened or what should happen.
    pub event_type: EventType,

    /// The step this envelope pertains to; empty for START and COMPLETED.
    pub step_name: String,

    /// Participant-owned payload.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,

    /// Unique per envelope instance.
    pub correlation_id: CorrelationId,

    /// When the envelope was produced.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Creates a new envelope builder.
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    /// Builds a result envelope for the same saga with a fresh correlation ID.
    pub fn reply(
        &self,
        event_type: EventType,
        step_name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Envelope {
        Envelope {
            saga_id: self.saga_id,
            saga_type: self.saga_type.clone(),
            event_type,
            step_name: step_name.into(),
            payload,
            correlation_id: CorrelationId::new(),
            timestamp: Utc::now(),
        }
    }

    /// Deserializes the JSON payload into a participant-owned type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            DecodeError::malformed(format!(
                "{} payload for step '{}': {e}",
                self.event_type, self.step_name
            ))
        })
    }

    /// Returns true for the envelopes the orchestrator emits when a saga ends.
    pub fn is_terminal_notice(&self) -> bool {
        match self.event_type {
            EventType::Completed => true,
            EventType::Failed => self.step_name.is_empty(),
            _ => false,
        }
    }

    /// Returns true for participant results the orchestrator must act on.
    pub fn is_step_result(&self) -> bool {
        match self.event_type {
            EventType::StepCompleted | EventType::Compensated => true,
            EventType::Failed => !self.step_name.is_empty(),
            _ => false,
        }
    }

    /// Returns true for the commands participants execute.
    pub fn is_participant_command(&self) -> bool {
        matches!(
            self.event_type,
            EventType::Start | EventType::Step | EventType::Compensate
        )
    }
}

/// Builder for constructing envelopes.
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    saga_id: Option<SagaId>,
    saga_type: Option<String>,
    event_type: Option<EventType>,
    step_name: String,
    payload: Vec<u8>,
    correlation_id: Option<CorrelationId>,
    timestamp: Option<DateTime<Utc>>,
}

impl EnvelopeBuilder {
    /// Sets the saga ID.
    pub fn saga_id(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Sets the saga type.
    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Sets the step name. Defaults to empty.
    pub fn step_name(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = step_name.into();
        self
    }

    /// Sets the raw payload bytes. Defaults to empty.
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload_json<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_vec(payload)?;
        Ok(self)
    }

    /// Sets the correlation ID. If not set, a new ID is generated.
    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the timestamp. If not set, the current time is used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builds the envelope.
    ///
    /// # Panics
    ///
    /// Panics if saga_id, saga_type or event_type are not set.
    pub fn build(self) -> Envelope {
        Envelope {
            saga_id: self.saga_id.expect("saga_id is required"),
            saga_type: self.saga_type.expect("saga_type is required"),
            event_type: self.event_type.expect("event_type is required"),
            step_name: self.step_name,
            payload: self.payload,
            correlation_id: self.correlation_id.unwrap_or_default(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }

    /// Tries to build the envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<Envelope> {
        Some(Envelope {
            saga_id: self.saga_id?,
            saga_type: self.saga_type?,
            event_type: self.event_type?,
            step_name: self.step_name,
            payload: self.payload,
            correlation_id: self.correlation_id.unwrap_or_default(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

mod payload_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
