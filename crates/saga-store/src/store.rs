use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{HistoryEntry, Result, SagaId, SagaQuery, SagaRecord, StoreError, Version};

/// A stream of saga records.
pub type SagaStream = Pin<Box<dyn Stream<Item = Result<SagaRecord>> + Send>>;

/// Durable storage for saga records.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// Fails with `DuplicateReference` if a non-terminal record already
    /// exists for the same saga type and reference ID. The check and the
    /// insert are atomic.
    async fn insert(&self, record: &SagaRecord) -> Result<()>;

    /// Loads a record by saga ID.
    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaRecord>>;

    /// Replaces a record if its stored version still equals `expected`.
    ///
    /// The stored version becomes `expected.next()`, which is returned.
    /// Fails with `Conflict` if someone else updated the record first. New
    /// history entries are appended; existing ones are never rewritten.
    async fn update(&self, record: &SagaRecord, expected: Version) -> Result<Version>;

    /// Finds the non-terminal record for a saga type and reference ID.
    async fn find_active_by_reference(
        &self,
        saga_type: &str,
        reference_id: &str,
    ) -> Result<Option<SagaRecord>>;

    /// Returns a saga's history, oldest first.
    async fn history(&self, saga_id: SagaId) -> Result<Vec<HistoryEntry>>;

    /// Lists records matching a query.
    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaRecord>>;

    /// Streams every record that is non-terminal or still has an outbox.
    async fn stream_in_flight(&self) -> Result<SagaStream>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Loads a record, failing with `NotFound` if it does not exist.
    async fn get(&self, saga_id: SagaId) -> Result<SagaRecord> {
        self.load(saga_id)
            .await?
            .ok_or(StoreError::NotFound(saga_id))
    }

    /// Checks if a saga exists.
    async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.load(saga_id).await?.is_some())
    }
}

impl<T: SagaStore + ?Sized> SagaStoreExt for T {}
