//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and truncate its tables, so
//! they are serialized. Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use envelope::{Envelope, EventType};
use futures_util::StreamExt;
use saga_store::{
    ApplyOutcome, IdempotencyKey, IdempotencyTracker, PostgresIdempotencyTracker,
    PostgresSagaStore, SagaId, SagaQuery, SagaRecord, SagaState, SagaStore, SagaStoreExt,
    StoreError, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE saga_history, sagas, idempotency_keys, idempotency_terminal_sagas",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

fn create_record(reference_id: &str) -> SagaRecord {
    let mut record = SagaRecord::new(
        SagaId::new(),
        "PAYMENT_TRANSFER",
        reference_id,
        br#"{"amount":10}"#.to_vec(),
        Utc::now(),
    );
    record.record_history(EventType::Start, "", Utc::now());
    record.outbox.push(
        Envelope::builder()
            .saga_id(record.saga_id)
            .saga_type("PAYMENT_TRANSFER")
            .event_type(EventType::Start)
            .payload(record.payload.clone())
            .build(),
    );
    record
}

#[tokio::test]
#[serial]
async fn insert_and_load_round_trips_every_field() {
    let store = PostgresSagaStore::new(get_test_pool().await);
    let mut record = create_record("ref-1");
    record
        .step_outputs
        .insert("initiate_payment".to_string(), b"{\"paymentId\":\"PAY-0001\"}".to_vec());
    record.completed_steps.push("initiate_payment".to_string());
    record.step_deadline = Some(Utc::now() + Duration::seconds(30));

    store.insert(&record).await.unwrap();
    let loaded = store.get(record.saga_id).await.unwrap();

    assert_eq!(loaded.saga_type, record.saga_type);
    assert_eq!(loaded.reference_id, "ref-1");
    assert_eq!(loaded.state, SagaState::Initiated);
    assert_eq!(loaded.version, Version::first());
    assert_eq!(loaded.payload, record.payload);
    assert_eq!(loaded.completed_steps, record.completed_steps);
    assert_eq!(loaded.step_outputs, record.step_outputs);
    assert_eq!(loaded.outbox, record.outbox);
    assert_eq!(loaded.history.len(), 1);
    assert_eq!(loaded.history[0].event_type, EventType::Start);
    assert!(loaded.step_deadline.is_some());
}

#[tokio::test]
#[serial]
async fn duplicate_active_reference_is_rejected() {
    let store = PostgresSagaStore::new(get_test_pool().await);
    store.insert(&create_record("ref-1")).await.unwrap();

    let err = store.insert(&create_record("ref-1")).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateReference { .. }));
}

#[tokio::test]
#[serial]
async fn terminal_saga_frees_its_reference() {
    let store = PostgresSagaStore::new(get_test_pool().await);
    let mut record = create_record("ref-1");
    store.insert(&record).await.unwrap();

    record.state = SagaState::Completed;
    store.update(&record, Version::first()).await.unwrap();

    store.insert(&create_record("ref-1")).await.unwrap();
    assert!(
        store
            .find_active_by_reference("PAYMENT_TRANSFER", "ref-1")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
#[serial]
async fn update_is_compare_and_set() {
    let store = PostgresSagaStore::new(get_test_pool().await);
    let mut record = create_record("ref-1");
    store.insert(&record).await.unwrap();

    record.state = SagaState::StepInProgress;
    record.current_step_index = 1;
    record.outbox.clear();
    record.record_history(EventType::StepCompleted, "initiate_payment", Utc::now());
    let v2 = store.update(&record, Version::first()).await.unwrap();
    assert_eq!(v2, Version::new(2));

    let err = store.update(&record, Version::first()).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    let loaded = store.get(record.saga_id).await.unwrap();
    assert_eq!(loaded.version, v2);
    assert_eq!(loaded.current_step_index, 1);
    assert!(loaded.outbox.is_empty());
    assert_eq!(loaded.history.len(), 2);
}

#[tokio::test]
#[serial]
async fn update_missing_saga_is_not_found() {
    let store = PostgresSagaStore::new(get_test_pool().await);
    let err = store
        .update(&create_record("ghost"), Version::first())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
#[serial]
async fn history_of_unknown_saga_is_not_found() {
    let store = PostgresSagaStore::new(get_test_pool().await);
    let err = store.history(SagaId::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
#[serial]
async fn query_filters_by_type_and_state() {
    let store = PostgresSagaStore::new(get_test_pool().await);
    for i in 0..3 {
        store.insert(&create_record(&format!("ref-{i}"))).await.unwrap();
    }
    let mut account = create_record("acc");
    account.saga_type = "ACCOUNT_CREATION".to_string();
    store.insert(&account).await.unwrap();

    let payments = store
        .query(SagaQuery::new().saga_type("PAYMENT_TRANSFER"))
        .await
        .unwrap();
    assert_eq!(payments.len(), 3);

    let page = store
        .query(
            SagaQuery::new()
                .state(SagaState::Initiated)
                .limit(2)
                .offset(1),
        )
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
}

#[tokio::test]
#[serial]
async fn stream_in_flight_includes_terminal_sagas_with_outbox() {
    let store = PostgresSagaStore::new(get_test_pool().await);

    let running = create_record("running");
    store.insert(&running).await.unwrap();

    let mut settled = create_record("settled");
    store.insert(&settled).await.unwrap();
    settled.state = SagaState::Completed;
    settled.outbox.clear();
    store.update(&settled, Version::first()).await.unwrap();

    let mut unpublished = create_record("unpublished");
    store.insert(&unpublished).await.unwrap();
    unpublished.state = SagaState::Failed;
    store.update(&unpublished, Version::first()).await.unwrap();

    let mut ids: Vec<SagaId> = store
        .stream_in_flight()
        .await
        .unwrap()
        .map(|r| r.unwrap().saga_id)
        .collect()
        .await;
    ids.sort();

    let mut expected = vec![running.saga_id, unpublished.saga_id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
#[serial]
async fn tracker_claims_once_per_consumer() {
    let pool = get_test_pool().await;
    let orchestrator = PostgresIdempotencyTracker::new(pool.clone(), "saga-orchestrator");
    let accounts = PostgresIdempotencyTracker::new(pool, "account-service");
    let key = IdempotencyKey::new(SagaId::new(), "create_account", EventType::StepCompleted);

    assert!(!orchestrator.is_applied(&key).await.unwrap());
    assert_eq!(orchestrator.try_apply(&key).await.unwrap(), ApplyOutcome::Applied);
    assert!(orchestrator.is_applied(&key).await.unwrap());
    assert!(!accounts.is_applied(&key).await.unwrap());
    assert_eq!(
        orchestrator.try_apply(&key).await.unwrap(),
        ApplyOutcome::AlreadyApplied
    );
    assert_eq!(accounts.try_apply(&key).await.unwrap(), ApplyOutcome::Applied);

    orchestrator.release(&key).await.unwrap();
    assert_eq!(orchestrator.try_apply(&key).await.unwrap(), ApplyOutcome::Applied);
}

#[tokio::test]
#[serial]
async fn tracker_collects_only_expired_terminal_sagas() {
    let tracker = PostgresIdempotencyTracker::new(get_test_pool().await, "saga-orchestrator");
    let done = SagaId::new();
    let running = SagaId::new();
    for id in [done, running] {
        tracker
            .try_apply(&IdempotencyKey::new(id, "s", EventType::Compensated))
            .await
            .unwrap();
    }

    let now = Utc::now();
    tracker.mark_terminal(done, now).await.unwrap();

    assert_eq!(
        tracker
            .collect_garbage(now, Duration::hours(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        tracker
            .collect_garbage(now + Duration::hours(2), Duration::hours(1))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        tracker
            .try_apply(&IdempotencyKey::new(running, "s", EventType::Compensated))
            .await
            .unwrap(),
        ApplyOutcome::AlreadyApplied
    );
}
