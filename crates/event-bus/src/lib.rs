//! Event bus adapter for saga envelopes.
//!
//! The bus carries encoded envelopes on a single topic, partitioned by saga
//! ID so that every consumer group sees one saga's messages in publish order.
//! Publishing tolerates transient broker failures through [`RetryPolicy`];
//! messages that cannot be delivered or decoded end up in a
//! [`DeadLetterQueue`].

pub mod bus;
pub mod dead_letter;
pub mod error;
pub mod memory;
pub mod retry;

pub use bus::{Delivery, EventBus, SAGA_EVENTS_TOPIC, Subscription, partition_for};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use error::{BusError, Result};
pub use memory::InMemoryEventBus;
pub use retry::{RetryPolicy, RetryingPublisher, publish_with_retry};
