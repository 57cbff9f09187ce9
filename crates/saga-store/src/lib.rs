//! Saga persistence.
//!
//! The [`SagaStore`] holds one mutable record per saga instance, updated with
//! compare-and-set on its [`Version`]. The [`IdempotencyTracker`] remembers,
//! per consumer, which semantic events have already been applied. Both come
//! in an in-memory flavour for tests and a PostgreSQL flavour for deployment.

pub mod error;
pub mod idempotency;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;

pub use common::{SagaId, SagaState};
pub use error::{Result, StoreError};
pub use idempotency::{ApplyOutcome, IdempotencyKey, IdempotencyTracker};
pub use memory::{InMemoryIdempotencyTracker, InMemorySagaStore};
pub use postgres::{PostgresIdempotencyTracker, PostgresSagaStore};
pub use query::SagaQuery;
pub use record::{HistoryEntry, SagaRecord, Version};
pub use store::{SagaStore, SagaStoreExt, SagaStream};
