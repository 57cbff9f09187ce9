use thiserror::Error;

/// Errors raised while decoding an envelope or its payload.
///
/// Both variants are non-retriable: redelivering the same bytes yields the
/// same error, so consumers route the message to the dead-letter channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Required fields are absent or have the wrong shape.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The `eventType` field holds a value this protocol does not define.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl std::fmt::Display) -> Self {
        DecodeError::MalformedPayload(reason.to_string())
    }
}

/// Result type for decoding operations.
pub type Result<T> = std::result::Result<T, DecodeError>;
