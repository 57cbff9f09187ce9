//! JSON wire codec for envelopes.
//!
//! Encoding writes the fields in declaration order, so the same logical
//! envelope always produces the same bytes. Decoding ignores fields it does
//! not know, which lets producers add fields before consumers learn them.

use serde_json::Value;

use crate::envelope::{Envelope, EventType};
use crate::error::{DecodeError, Result};

const EVENT_TYPE_FIELD: &str = "eventType";

/// Encodes an envelope to its JSON wire form.
pub fn encode(envelope: &Envelope) -> std::result::Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Decodes an envelope from its JSON wire form.
///
/// The event type is checked before the rest of the document so that a
/// well-formed envelope from a newer protocol revision is reported as
/// `UnknownEventType` rather than as a shape error.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::malformed(format!("invalid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::malformed("envelope is not a JSON object"))?;

    match object.get(EVENT_TYPE_FIELD) {
        None => return Err(DecodeError::malformed("missing field `eventType`")),
        Some(Value::String(name)) => {
            if EventType::parse(name).is_none() {
                return Err(DecodeError::UnknownEventType(name.clone()));
            }
        }
        Some(other) => {
            return Err(DecodeError::malformed(format!(
                "`eventType` must be a string, got {other}"
            )));
        }
    }

    serde_json::from_value(value).map_err(DecodeError::malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{CorrelationId, SagaId};
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::builder()
            .saga_id(SagaId::new())
            .saga_type("ACCOUNT_CREATION")
            .event_type(EventType::StepCompleted)
            .step_name("create_account")
            .payload(br#"{"accountNumber":"ACC-0001"}"#.to_vec())
            .correlation_id(CorrelationId::new())
            .timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
            .build()
    }

    #[test]
    fn decode_recovers_encoded_envelope() {
        let envelope = sample();
        let bytes = encode(&envelope).unwrap();
        assert_eq!(decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn encoding_is_deterministic() {
        let envelope = sample();
        assert_eq!(encode(&envelope).unwrap(), encode(&envelope.clone()).unwrap());
    }

    #[test]
    fn wire_uses_protocol_field_names() {
        let envelope = sample();
        let value: Value = serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();

        assert_eq!(value["sagaId"], json!(envelope.saga_id.to_string()));
        assert_eq!(value["sagaType"], json!("ACCOUNT_CREATION"));
        assert_eq!(value["eventType"], json!("STEP_COMPLETED"));
        assert_eq!(value["stepName"], json!("create_account"));
        assert_eq!(value["correlationId"], json!(envelope.correlation_id.to_string()));
        assert!(value["payload"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let envelope = sample();
        let mut value: Value = serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();
        value["schemaVersion"] = json!(2);
        value["traceId"] = json!("abc");

        let decoded = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unknown_event_type_is_reported() {
        let mut value: Value = serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        value["eventType"] = json!("ACCOUNT_OPENED");

        let err = decode(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert_eq!(err, DecodeError::UnknownEventType("ACCOUNT_OPENED".to_string()));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let mut value: Value = serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("sagaId");

        let err = decode(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
    }

    #[test]
    fn wrong_shapes_are_malformed() {
        assert!(matches!(
            decode(b"not json"),
            Err(DecodeError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode(b"[1,2,3]"),
            Err(DecodeError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode(br#"{"eventType": 7}"#),
            Err(DecodeError::MalformedPayload(_))
        ));

        let mut value: Value = serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        value["sagaId"] = json!("ref-1");
        assert!(matches!(
            decode(&serde_json::to_vec(&value).unwrap()),
            Err(DecodeError::MalformedPayload(_))
        ));

        value = serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        value["payload"] = json!("***not base64***");
        assert!(matches!(
            decode(&serde_json::to_vec(&value).unwrap()),
            Err(DecodeError::MalformedPayload(_))
        ));
    }
}
