use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::{
    ApplyOutcome, HistoryEntry, IdempotencyKey, IdempotencyTracker, Result, SagaId, SagaQuery,
    SagaRecord, StoreError, Version,
    store::{SagaStore, SagaStream},
};

/// In-memory saga store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    records: Arc<RwLock<HashMap<SagaId, SagaRecord>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Clears all records.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert(&self, record: &SagaRecord) -> Result<()> {
        let mut records = self.records.write().await;

        if records.contains_key(&record.saga_id) {
            return Err(StoreError::AlreadyExists(record.saga_id));
        }

        let duplicate = records.values().any(|r| {
            !r.is_terminal()
                && r.saga_type == record.saga_type
                && r.reference_id == record.reference_id
        });
        if duplicate {
            return Err(StoreError::DuplicateReference {
                saga_type: record.saga_type.clone(),
                reference_id: record.reference_id.clone(),
            });
        }

        let mut stored = record.clone();
        stored.version = Version::first();
        records.insert(stored.saga_id, stored);
        Ok(())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.records.read().await.get(&saga_id).cloned())
    }

    async fn update(&self, record: &SagaRecord, expected: Version) -> Result<Version> {
        let mut records = self.records.write().await;

        let current = records
            .get_mut(&record.saga_id)
            .ok_or(StoreError::NotFound(record.saga_id))?;

        if current.version != expected {
            return Err(StoreError::Conflict {
                saga_id: record.saga_id,
                expected,
                actual: current.version,
            });
        }

        // History is append-only: keep what is stored, take only the tail.
        let mut history = std::mem::take(&mut current.history);
        let stored = history.len();
        history.extend(record.history.iter().skip(stored).cloned());

        let next = expected.next();
        *current = SagaRecord {
            history,
            version: next,
            ..record.clone()
        };
        Ok(next)
    }

    async fn find_active_by_reference(
        &self,
        saga_type: &str,
        reference_id: &str,
    ) -> Result<Option<SagaRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| {
                !r.is_terminal() && r.saga_type == saga_type && r.reference_id == reference_id
            })
            .cloned())
    }

    async fn history(&self, saga_id: SagaId) -> Result<Vec<HistoryEntry>> {
        self.records
            .read()
            .await
            .get(&saga_id)
            .map(|r| r.history.clone())
            .ok_or(StoreError::NotFound(saga_id))
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.created_at, r.saga_id));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn stream_in_flight(&self) -> Result<SagaStream> {
        let records = self.records.read().await;
        let mut in_flight: Vec<_> = records
            .values()
            .filter(|r| r.is_in_flight())
            .cloned()
            .collect();
        in_flight.sort_by_key(|r| (r.created_at, r.saga_id));

        let stream = futures_util::stream::iter(in_flight.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }
}

/// In-memory idempotency tracker.
///
/// One instance per consumer; sharing an instance between consumers would
/// make one consumer's work look like another's duplicate.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyTracker {
    inner: Arc<RwLock<TrackerState>>,
}

#[derive(Default)]
struct TrackerState {
    applied: HashMap<IdempotencyKey, DateTime<Utc>>,
    terminal: HashMap<SagaId, DateTime<Utc>>,
}

impl InMemoryIdempotencyTracker {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys held.
    pub async fn len(&self) -> usize {
        self.inner.read().await.applied.len()
    }

    /// Returns true if no keys are held.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.applied.is_empty()
    }

    /// Returns true if the key has been applied.
    pub async fn contains(&self, key: &IdempotencyKey) -> bool {
        self.inner.read().await.applied.contains_key(key)
    }
}

#[async_trait]
impl IdempotencyTracker for InMemoryIdempotencyTracker {
    async fn is_applied(&self, key: &IdempotencyKey) -> Result<bool> {
        Ok(self.contains(key).await)
    }

    async fn try_apply(&self, key: &IdempotencyKey) -> Result<ApplyOutcome> {
        let mut state = self.inner.write().await;
        if state.applied.contains_key(key) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        state.applied.insert(key.clone(), Utc::now());
        Ok(ApplyOutcome::Applied)
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        self.inner.write().await.applied.remove(key);
        Ok(())
    }

    async fn mark_terminal(&self, saga_id: SagaId, at: DateTime<Utc>) -> Result<()> {
        self.inner
            .write()
            .await
            .terminal
            .entry(saga_id)
            .or_insert(at);
        Ok(())
    }

    async fn collect_garbage(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let mut state = self.inner.write().await;
        let cutoff = now - retention;

        let expired: Vec<SagaId> = state
            .terminal
            .iter()
            .filter(|(_, at)| **at <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let before = state.applied.len();
        state.applied.retain(|key, _| !expired.contains(&key.saga_id));
        for id in &expired {
            state.terminal.remove(id);
        }
        Ok(before - state.applied.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SagaState, SagaStoreExt};
    use envelope::EventType;
    use futures_util::StreamExt;

    fn record(reference_id: &str) -> SagaRecord {
        SagaRecord::new(
            SagaId::new(),
            "ACCOUNT_CREATION",
            reference_id,
            b"{}".to_vec(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_and_load() {
        let store = InMemorySagaStore::new();
        let r = record("ref-1");
        store.insert(&r).await.unwrap();

        let loaded = store.get(r.saga_id).await.unwrap();
        assert_eq!(loaded, r);
        assert!(store.exists(r.saga_id).await.unwrap());
        assert!(!store.exists(SagaId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_active_reference_is_rejected() {
        let store = InMemorySagaStore::new();
        store.insert(&record("ref-1")).await.unwrap();

        let err = store.insert(&record("ref-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReference { .. }));

        // Same reference under a different saga type is fine.
        let mut other = record("ref-1");
        other.saga_type = "PAYMENT_TRANSFER".to_string();
        store.insert(&other).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_saga_frees_its_reference() {
        let store = InMemorySagaStore::new();
        let mut first = record("ref-1");
        store.insert(&first).await.unwrap();

        first.state = SagaState::Completed;
        store.update(&first, Version::first()).await.unwrap();

        store.insert(&record("ref-1")).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn update_is_compare_and_set() {
        let store = InMemorySagaStore::new();
        let mut r = record("ref-1");
        store.insert(&r).await.unwrap();

        r.state = SagaState::StepInProgress;
        let v2 = store.update(&r, Version::first()).await.unwrap();
        assert_eq!(v2, Version::new(2));

        // Stale writer still thinks the record is at version 1.
        let err = store.update(&r, Version::first()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict { expected, actual, .. }
                if expected == Version::first() && actual == v2
        ));

        let loaded = store.get(r.saga_id).await.unwrap();
        assert_eq!(loaded.version, v2);
        assert_eq!(loaded.state, SagaState::StepInProgress);
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let store = InMemorySagaStore::new();
        let err = store.update(&record("x"), Version::first()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn history_is_never_rewritten() {
        let store = InMemorySagaStore::new();
        let mut r = record("ref-1");
        r.record_history(EventType::Start, "", Utc::now());
        store.insert(&r).await.unwrap();

        let mut rewritten = r.clone();
        rewritten.history[0].step_name = "tampered".to_string();
        rewritten.record_history(EventType::StepCompleted, "create_account", Utc::now());
        store.update(&rewritten, Version::first()).await.unwrap();

        let history = store.history(r.saga_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].step_name, "");
        assert_eq!(history[1].step_name, "create_account");
    }

    #[tokio::test]
    async fn query_filters_and_pages() {
        let store = InMemorySagaStore::new();
        for i in 0..5 {
            store.insert(&record(&format!("ref-{i}"))).await.unwrap();
        }

        let all = store.query(SagaQuery::new()).await.unwrap();
        assert_eq!(all.len(), 5);

        let page = store
            .query(SagaQuery::new().saga_type("ACCOUNT_CREATION").offset(1).limit(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].saga_id, all[1].saga_id);

        let none = store
            .query(SagaQuery::new().state(SagaState::Failed))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn stream_in_flight_skips_settled_sagas() {
        let store = InMemorySagaStore::new();
        let active = record("a");
        let mut done = record("b");
        store.insert(&active).await.unwrap();
        store.insert(&done).await.unwrap();
        done.state = SagaState::Failed;
        store.update(&done, Version::first()).await.unwrap();

        let ids: Vec<SagaId> = store
            .stream_in_flight()
            .await
            .unwrap()
            .map(|r| r.unwrap().saga_id)
            .collect()
            .await;
        assert_eq!(ids, vec![active.saga_id]);
    }

    #[tokio::test]
    async fn tracker_claims_once() {
        let tracker = InMemoryIdempotencyTracker::new();
        let key = IdempotencyKey::new(SagaId::new(), "create_account", EventType::StepCompleted);

        assert!(!tracker.is_applied(&key).await.unwrap());
        assert_eq!(tracker.try_apply(&key).await.unwrap(), ApplyOutcome::Applied);
        assert!(tracker.is_applied(&key).await.unwrap());
        assert_eq!(
            tracker.try_apply(&key).await.unwrap(),
            ApplyOutcome::AlreadyApplied
        );

        tracker.release(&key).await.unwrap();
        assert_eq!(tracker.try_apply(&key).await.unwrap(), ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn tracker_keeps_keys_until_retention_passes() {
        let tracker = InMemoryIdempotencyTracker::new();
        let done = SagaId::new();
        let running = SagaId::new();
        for id in [done, running] {
            tracker
                .try_apply(&IdempotencyKey::new(id, "s", EventType::StepCompleted))
                .await
                .unwrap();
        }

        let now = Utc::now();
        let retention = Duration::hours(1);

        // Never collected while running.
        assert_eq!(tracker.collect_garbage(now, retention).await.unwrap(), 0);

        tracker.mark_terminal(done, now).await.unwrap();
        assert_eq!(tracker.collect_garbage(now, retention).await.unwrap(), 0);

        let later = now + Duration::hours(2);
        assert_eq!(tracker.collect_garbage(later, retention).await.unwrap(), 1);
        assert_eq!(tracker.len().await, 1);
        assert!(
            tracker
                .contains(&IdempotencyKey::new(running, "s", EventType::StepCompleted))
                .await
        );
    }
}
