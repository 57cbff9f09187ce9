//! Event envelope exchanged between the saga orchestrator and participants.
//!
//! Every message on the bus is an [`Envelope`]: a fixed set of routing fields
//! plus an opaque payload owned by the participant that produced it. The
//! [`codec`] module turns envelopes into JSON bytes and back; the
//! [`SchemaRegistry`] decodes payloads on demand for a given saga step.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod schema;

pub use codec::{decode, encode};
pub use common::{CorrelationId, SagaId};
pub use envelope::{Envelope, EnvelopeBuilder, EventType};
pub use error::{DecodeError, Result};
pub use schema::SchemaRegistry;
