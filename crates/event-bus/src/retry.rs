use std::sync::Arc;
use std::time::Duration;

use envelope::Envelope;

use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::{BusError, EventBus, Result};

/// Bounded exponential backoff for publishing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Returns the delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Publishes an envelope, retrying retriable failures with backoff.
///
/// Returns the number of attempts used. Non-retriable errors are returned
/// immediately; exhausting the policy yields [`BusError::RetriesExhausted`].
pub async fn publish_with_retry<B: EventBus + ?Sized>(
    bus: &B,
    envelope: &Envelope,
    policy: &RetryPolicy,
) -> Result<u32> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match bus.publish(envelope).await {
            Ok(()) => return Ok(attempt),
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                return Err(BusError::RetriesExhausted {
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.backoff_for(attempt);
                tracing::debug!(
                    saga_id = %envelope.saga_id,
                    event_type = %envelope.event_type,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Publish failed, retrying"
                );
                metrics::counter!("saga_publish_retries_total").increment(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Publisher that retries and dead-letters what it cannot deliver.
pub struct RetryingPublisher<B: EventBus> {
    bus: Arc<B>,
    policy: RetryPolicy,
    dead_letters: DeadLetterQueue,
}

impl<B: EventBus> RetryingPublisher<B> {
    /// Creates a publisher over the given bus.
    pub fn new(bus: Arc<B>, policy: RetryPolicy, dead_letters: DeadLetterQueue) -> Self {
        Self {
            bus,
            policy,
            dead_letters,
        }
    }

    /// Returns the dead-letter queue.
    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Publishes with retries. On failure the envelope is dead-lettered, an
    /// alert is logged, and the error is returned.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        match publish_with_retry(self.bus.as_ref(), envelope, &self.policy).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let attempts = match &e {
                    BusError::RetriesExhausted { attempts, .. } => *attempts,
                    _ => 1,
                };
                tracing::error!(
                    saga_id = %envelope.saga_id,
                    event_type = %envelope.event_type,
                    step_name = %envelope.step_name,
                    attempts,
                    error = %e,
                    "Giving up on publish, envelope dead-lettered"
                );
                let bytes = envelope::encode(envelope).unwrap_or_default();
                self.dead_letters
                    .push(DeadLetter::undeliverable(bytes, attempts, e.to_string()))
                    .await;
                Err(e)
            }
        }
    }
}

impl<B: EventBus> Clone for RetryingPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            policy: self.policy.clone(),
            dead_letters: self.dead_letters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryEventBus;
    use common::SagaId;
    use envelope::EventType;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    fn envelope() -> Envelope {
        Envelope::builder()
            .saga_id(SagaId::new())
            .saga_type("ACCOUNT_CREATION")
            .event_type(EventType::StepCompleted)
            .step_name("create_account")
            .build()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(20), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retries_through_transient_failures() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(2);

        let attempts = publish_with_retry(&bus, &envelope(), &fast_policy(5))
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(10);

        let err = publish_with_retry(&bus, &envelope(), &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn retrying_publisher_dead_letters_on_exhaustion() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.fail_next_publishes(10);
        let publisher = RetryingPublisher::new(bus.clone(), fast_policy(2), DeadLetterQueue::new());

        let env = envelope();
        assert!(publisher.publish(&env).await.is_err());

        let letters = publisher.dead_letters().entries().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(envelope::decode(&letters[0].payload).unwrap(), env);
    }
}
