//! Payload schemas keyed by saga type and step name.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::envelope::Envelope;
use crate::error::{DecodeError, Result};

type Validator = Box<dyn Fn(&[u8]) -> std::result::Result<(), serde_json::Error> + Send + Sync>;

/// Registry of payload types per (saga type, step name).
///
/// Envelopes stay untyped on the bus; a consumer that owns a step registers
/// the payload type it expects and validates before acting. START payloads
/// are registered under an empty step name.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(String, String), Validator>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` as the payload type for the given saga step.
    pub fn register<T: DeserializeOwned + 'static>(
        &mut self,
        saga_type: impl Into<String>,
        step_name: impl Into<String>,
    ) {
        self.schemas.insert(
            (saga_type.into(), step_name.into()),
            Box::new(|bytes| serde_json::from_slice::<T>(bytes).map(|_| ())),
        );
    }

    /// Returns true if a schema is registered for the given saga step.
    pub fn is_registered(&self, saga_type: &str, step_name: &str) -> bool {
        self.schemas
            .contains_key(&(saga_type.to_string(), step_name.to_string()))
    }

    /// Validates an envelope's payload against its registered schema.
    ///
    /// Envelopes without a registered schema pass: the payload is opaque
    /// unless someone claims it.
    pub fn validate(&self, envelope: &Envelope) -> Result<()> {
        let key = (envelope.saga_type.clone(), envelope.step_name.clone());
        match self.schemas.get(&key) {
            Some(validator) => validator(&envelope.payload).map_err(|e| {
                DecodeError::MalformedPayload(format!(
                    "{}/{} payload does not match schema: {e}",
                    envelope.saga_type, envelope.step_name
                ))
            }),
            None => Ok(()),
        }
    }

    /// Returns the number of registered schemas.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no schemas are registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use common::SagaId;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Transfer {
        amount: f64,
        currency: String,
    }

    fn envelope(step_name: &str, payload: &[u8]) -> Envelope {
        Envelope::builder()
            .saga_id(SagaId::new())
            .saga_type("PAYMENT_TRANSFER")
            .event_type(EventType::Step)
            .step_name(step_name)
            .payload(payload.to_vec())
            .build()
    }

    #[test]
    fn validates_registered_step() {
        let mut registry = SchemaRegistry::new();
        registry.register::<Transfer>("PAYMENT_TRANSFER", "update_balances");

        assert!(registry.is_registered("PAYMENT_TRANSFER", "update_balances"));
        assert!(
            registry
                .validate(&envelope(
                    "update_balances",
                    br#"{"amount": 10.0, "currency": "USD"}"#
                ))
                .is_ok()
        );

        let err = registry
            .validate(&envelope("update_balances", br#"{"amount": "ten"}"#))
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
    }

    #[test]
    fn unregistered_steps_pass_through() {
        let registry = SchemaRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.validate(&envelope("anything", b"\x00\x01")).is_ok());
    }
}
