use async_trait::async_trait;
use common::SagaId;
use envelope::Envelope;
use tokio::sync::mpsc;

use crate::Result;

/// The topic carrying every saga envelope.
pub const SAGA_EVENTS_TOPIC: &str = "saga-events";

/// A raw message handed to a consumer.
///
/// Consumers receive bytes rather than envelopes so that decode failures are
/// observed, and dead-lettered, where the message is consumed.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The partition the message was read from.
    pub partition: usize,
    /// The encoded envelope.
    pub payload: Vec<u8>,
}

/// A consumer group's view of the topic: one ordered channel per partition.
#[derive(Debug)]
pub struct Subscription {
    group: String,
    partitions: Vec<mpsc::UnboundedReceiver<Delivery>>,
}

impl Subscription {
    /// Creates a subscription from per-partition receivers.
    pub fn new(group: impl Into<String>, partitions: Vec<mpsc::UnboundedReceiver<Delivery>>) -> Self {
        Self {
            group: group.into(),
            partitions,
        }
    }

    /// Returns the consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns the number of partitions assigned to this subscription.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Splits the subscription into its partition receivers, so each can be
    /// drained by its own single-writer worker.
    pub fn into_partitions(self) -> Vec<mpsc::UnboundedReceiver<Delivery>> {
        self.partitions
    }
}

/// Publish/subscribe access to the saga topic.
///
/// Implementations must deliver messages that share a saga ID to a given
/// consumer group in the order they were published. Nothing is guaranteed
/// across sagas.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an envelope, partitioned by its saga ID.
    async fn publish(&self, envelope: &Envelope) -> Result<()>;

    /// Joins a consumer group and returns its partition channels.
    async fn subscribe(&self, group: &str) -> Result<Subscription>;
}

/// Maps a saga ID onto one of `partitions` partitions.
///
/// The mapping is stable across processes so every replica agrees on it.
pub fn partition_for(saga_id: SagaId, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    (saga_id.as_uuid().as_u128() % partitions as u128) as usize
}
