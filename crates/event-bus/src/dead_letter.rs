use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// A message that could not be delivered or processed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The raw message bytes, as published or received.
    pub payload: Vec<u8>,
    /// Why the message was given up on.
    pub reason: String,
    /// The consumer group that rejected it, if it failed on consumption.
    pub consumer_group: Option<String>,
    /// How many attempts were made before giving up.
    pub attempts: u32,
    /// When the message was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// A message a consumer could not decode or process.
    pub fn rejected(payload: Vec<u8>, group: &str, reason: impl Into<String>) -> Self {
        Self {
            payload,
            reason: reason.into(),
            consumer_group: Some(group.to_string()),
            attempts: 1,
            failed_at: Utc::now(),
        }
    }

    /// A message that could not be published.
    pub fn undeliverable(payload: Vec<u8>, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            payload,
            reason: reason.into(),
            consumer_group: None,
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Shared queue of dead letters awaiting operator attention.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQueue {
    entries: Arc<Mutex<Vec<DeadLetter>>>,
}

impl DeadLetterQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dead letter and counts it.
    pub async fn push(&self, letter: DeadLetter) {
        tracing::warn!(
            reason = %letter.reason,
            consumer_group = letter.consumer_group.as_deref().unwrap_or("-"),
            attempts = letter.attempts,
            "Message dead-lettered"
        );
        metrics::counter!("saga_dead_letters_total").increment(1);
        self.entries.lock().await.push(letter);
    }

    /// Returns the number of queued dead letters.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns true if nothing has been dead-lettered.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Returns a copy of the queued dead letters.
    pub async fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().await.clone()
    }

    /// Removes and returns every queued dead letter.
    pub async fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.entries.lock().await)
    }
}
