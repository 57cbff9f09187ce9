use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use common::SagaId;
use envelope::Envelope;
use tokio::sync::{RwLock, mpsc};

use crate::bus::{Delivery, EventBus, Subscription, partition_for};
use crate::{BusError, Result};

/// Default number of partitions.
pub const DEFAULT_PARTITIONS: usize = 8;

/// In-memory event bus backed by per-partition channels.
///
/// Every consumer group gets its own copy of each message. Within a group a
/// saga's messages always land on the same partition, so they are delivered
/// in publish order. Subscribing to a group that already exists rebalances
/// every partition onto the new subscriber.
///
/// Besides delivery the bus keeps a log of everything published and can be
/// told to fail upcoming publishes, which tests use to simulate an outage.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: usize,
    groups: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>,
    published: RwLock<Vec<Envelope>>,
    failures_remaining: AtomicU32,
}

impl InMemoryEventBus {
    /// Creates a bus with the default partition count.
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a bus with the given number of partitions (at least one).
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                groups: RwLock::new(HashMap::new()),
                published: RwLock::new(Vec::new()),
                failures_remaining: AtomicU32::new(0),
            }),
        }
    }

    /// Returns the partition count.
    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    /// Makes the next `count` publishes fail with [`BusError::Unavailable`].
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delivers raw bytes to every group on the given partition.
    ///
    /// Skips encoding entirely, so callers can put bytes on the topic that no
    /// well-behaved producer would.
    pub async fn publish_raw(&self, partition: usize, bytes: Vec<u8>) {
        let partition = partition % self.inner.partitions;
        self.deliver(partition, bytes).await;
    }

    /// Returns every envelope published so far, in publish order.
    pub async fn published(&self) -> Vec<Envelope> {
        self.inner.published.read().await.clone()
    }

    /// Returns the envelopes published for one saga, in publish order.
    pub async fn published_for(&self, saga_id: SagaId) -> Vec<Envelope> {
        self.inner
            .published
            .read()
            .await
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect()
    }

    /// Returns the number of envelopes published so far.
    pub async fn published_count(&self) -> usize {
        self.inner.published.read().await.len()
    }

    /// Returns true once the consumer group has subscribed.
    pub async fn has_group(&self, group: &str) -> bool {
        self.inner.groups.read().await.contains_key(group)
    }

    async fn deliver(&self, partition: usize, bytes: Vec<u8>) {
        let mut closed = Vec::new();
        {
            let groups = self.inner.groups.read().await;
            for (group, senders) in groups.iter() {
                let delivery = Delivery {
                    partition,
                    payload: bytes.clone(),
                };
                if senders[partition].send(delivery).is_err() {
                    closed.push(group.clone());
                }
            }
        }

        if !closed.is_empty() {
            let mut groups = self.inner.groups.write().await;
            for group in closed {
                tracing::debug!(group = %group, "Dropping closed consumer group");
                groups.remove(&group);
            }
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let injected = self
            .inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Unavailable("broker not reachable".to_string()));
        }

        let bytes = envelope::encode(envelope)?;
        let partition = partition_for(envelope.saga_id, self.inner.partitions);

        // The log and the deliveries must agree on order, so hold the log
        // lock across delivery.
        let mut published = self.inner.published.write().await;
        self.deliver(partition, bytes).await;
        published.push(envelope.clone());

        tracing::trace!(
            saga_id = %envelope.saga_id,
            event_type = %envelope.event_type,
            step_name = %envelope.step_name,
            partition,
            "Published envelope"
        );

        Ok(())
    }

    async fn subscribe(&self, group: &str) -> Result<Subscription> {
        let mut senders = Vec::with_capacity(self.inner.partitions);
        let mut receivers = Vec::with_capacity(self.inner.partitions);
        for _ in 0..self.inner.partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let replaced = self
            .inner
            .groups
            .write()
            .await
            .insert(group.to_string(), senders)
            .is_some();

        tracing::debug!(group, partitions = self.inner.partitions, replaced, "Subscribed consumer group");

        Ok(Subscription::new(group, receivers))
    }
}
