use thiserror::Error;

/// Errors that can occur when talking to the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached; retrying may succeed.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The consumer group's channels were closed.
    #[error("Consumer group '{0}' is closed")]
    Closed(String),

    /// The envelope could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Every publish attempt failed.
    #[error("Publish failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

impl BusError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
