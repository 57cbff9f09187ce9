use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use envelope::{Envelope, EventType};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ApplyOutcome, HistoryEntry, IdempotencyKey, IdempotencyTracker, Result, SagaId, SagaQuery,
    SagaRecord, SagaState, StoreError, Version,
    store::{SagaStore, SagaStream},
};

const ACTIVE_REFERENCE_CONSTRAINT: &str = "uniq_active_saga_reference";
const SAGAS_PRIMARY_KEY: &str = "sagas_pkey";

const SAGA_COLUMNS: &str = "saga_id, saga_type, reference_id, state, current_step_index, payload, \
     completed_steps, step_outputs, pending_compensations, failure_payload, outbox, \
     step_deadline, version, created_at, updated_at";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Turns a row into a record without its history.
    fn row_to_record(row: &PgRow) -> Result<SagaRecord> {
        let state: String = row.try_get("state")?;
        let state = SagaState::parse(&state)
            .ok_or_else(|| StoreError::InvalidRecord(format!("unknown saga state '{state}'")))?;
        let current_step_index: i32 = row.try_get("current_step_index")?;

        Ok(SagaRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            reference_id: row.try_get("reference_id")?,
            state,
            current_step_index: usize::try_from(current_step_index).map_err(|_| {
                StoreError::InvalidRecord(format!("negative step index {current_step_index}"))
            })?,
            payload: row.try_get("payload")?,
            completed_steps: row.try_get::<Json<Vec<String>>, _>("completed_steps")?.0,
            step_outputs: row
                .try_get::<Json<BTreeMap<String, Vec<u8>>>, _>("step_outputs")?
                .0,
            pending_compensations: row
                .try_get::<Json<Vec<String>>, _>("pending_compensations")?
                .0,
            failure_payload: row.try_get("failure_payload")?,
            history: Vec::new(),
            outbox: row.try_get::<Json<Vec<Envelope>>, _>("outbox")?.0,
            step_deadline: row.try_get("step_deadline")?,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_history(row: &PgRow) -> Result<HistoryEntry> {
        let event_type: String = row.try_get("event_type")?;
        Ok(HistoryEntry {
            event_type: EventType::parse(&event_type).ok_or_else(|| {
                StoreError::InvalidRecord(format!("unknown event type '{event_type}'"))
            })?,
            step_name: row.try_get("step_name")?,
            timestamp: row.try_get("timestamp")?,
        })
    }

    async fn load_history(&self, saga_id: SagaId) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT event_type, step_name, timestamp
            FROM saga_history
            WHERE saga_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_history).collect()
    }

    async fn append_history(
        tx: &mut Transaction<'_, Postgres>,
        saga_id: SagaId,
        entries: &[HistoryEntry],
    ) -> Result<()> {
        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM saga_history WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_one(&mut **tx)
            .await?;

        for (seq, entry) in entries.iter().enumerate().skip(stored as usize) {
            sqlx::query(
                r#"
                INSERT INTO saga_history (saga_id, seq, event_type, step_name, timestamp)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(saga_id.as_uuid())
            .bind(seq as i32)
            .bind(entry.event_type.as_str())
            .bind(&entry.step_name)
            .bind(entry.timestamp)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn with_history(&self, records: Vec<SagaRecord>) -> Result<Vec<SagaRecord>> {
        let mut out = Vec::with_capacity(records.len());
        for mut record in records {
            record.history = self.load_history(record.saga_id).await?;
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn insert(&self, record: &SagaRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO sagas ({SAGA_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(record.saga_id.as_uuid())
        .bind(&record.saga_type)
        .bind(&record.reference_id)
        .bind(record.state.as_str())
        .bind(record.current_step_index as i32)
        .bind(&record.payload)
        .bind(Json(&record.completed_steps))
        .bind(Json(&record.step_outputs))
        .bind(Json(&record.pending_compensations))
        .bind(&record.failure_payload)
        .bind(Json(&record.outbox))
        .bind(record.step_deadline)
        .bind(Version::first().as_i64())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                match db_err.constraint() {
                    Some(ACTIVE_REFERENCE_CONSTRAINT) => {
                        return StoreError::DuplicateReference {
                            saga_type: record.saga_type.clone(),
                            reference_id: record.reference_id.clone(),
                        };
                    }
                    Some(SAGAS_PRIMARY_KEY) => return StoreError::AlreadyExists(record.saga_id),
                    _ => {}
                }
            }
            StoreError::Database(e)
        })?;

        Self::append_history(&mut tx, record.saga_id, &record.history).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let row: Option<PgRow> =
            sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE saga_id = $1"))
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => {
                let mut record = Self::row_to_record(&row)?;
                record.history = self.load_history(saga_id).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, record: &SagaRecord, expected: Version) -> Result<Version> {
        let next = expected.next();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE sagas SET
                state = $2,
                current_step_index = $3,
                completed_steps = $4,
                step_outputs = $5,
                pending_compensations = $6,
                failure_payload = $7,
                outbox = $8,
                step_deadline = $9,
                updated_at = $10,
                version = $11
            WHERE saga_id = $1 AND version = $12
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(record.state.as_str())
        .bind(record.current_step_index as i32)
        .bind(Json(&record.completed_steps))
        .bind(Json(&record.step_outputs))
        .bind(Json(&record.pending_compensations))
        .bind(&record.failure_payload)
        .bind(Json(&record.outbox))
        .bind(record.step_deadline)
        .bind(record.updated_at)
        .bind(next.as_i64())
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM sagas WHERE saga_id = $1")
                    .bind(record.saga_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;

            return Err(match actual {
                Some(actual) => StoreError::Conflict {
                    saga_id: record.saga_id,
                    expected,
                    actual: Version::new(actual),
                },
                None => StoreError::NotFound(record.saga_id),
            });
        }

        Self::append_history(&mut tx, record.saga_id, &record.history).await?;

        tx.commit().await?;
        Ok(next)
    }

    async fn find_active_by_reference(
        &self,
        saga_type: &str,
        reference_id: &str,
    ) -> Result<Option<SagaRecord>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas \
             WHERE saga_type = $1 AND reference_id = $2 AND state NOT IN ('COMPLETED', 'FAILED')"
        ))
        .bind(saga_type)
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut record = Self::row_to_record(&row)?;
                record.history = self.load_history(record.saga_id).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn history(&self, saga_id: SagaId) -> Result<Vec<HistoryEntry>> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sagas WHERE saga_id = $1)")
                .bind(saga_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(StoreError::NotFound(saga_id));
        }
        self.load_history(saga_id).await
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaRecord>> {
        let mut sql = format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE 1=1");
        let mut param_count = 0;

        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if query.state.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND state = ${param_count}"));
        }
        if query.reference_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND reference_id = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, saga_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(state) = query.state {
            sqlx_query = sqlx_query.bind(state.as_str());
        }
        if let Some(reference_id) = query.reference_id {
            sqlx_query = sqlx_query.bind(reference_id);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;
        self.with_history(records).await
    }

    async fn stream_in_flight(&self) -> Result<SagaStream> {
        use futures_util::StreamExt;

        let sql = format!(
            "SELECT {SAGA_COLUMNS} FROM sagas \
             WHERE state NOT IN ('COMPLETED', 'FAILED') OR jsonb_array_length(outbox) > 0 \
             ORDER BY created_at ASC, saga_id ASC"
        );

        // Rows are collected first so the pool connection is released before
        // recovery starts issuing its own queries.
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;
        let records = self.with_history(records).await?;

        Ok(Box::pin(futures_util::stream::iter(records).map(Ok)))
    }
}

/// PostgreSQL-backed idempotency tracker, scoped to one consumer.
#[derive(Clone)]
pub struct PostgresIdempotencyTracker {
    pool: PgPool,
    consumer: String,
}

impl PostgresIdempotencyTracker {
    /// Creates a tracker for the given consumer group.
    pub fn new(pool: PgPool, consumer: impl Into<String>) -> Self {
        Self {
            pool,
            consumer: consumer.into(),
        }
    }

    /// Returns the consumer this tracker belongs to.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

#[async_trait]
impl IdempotencyTracker for PostgresIdempotencyTracker {
    async fn is_applied(&self, key: &IdempotencyKey) -> Result<bool> {
        let applied: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM idempotency_keys
                WHERE consumer = $1 AND saga_id = $2 AND step_name = $3 AND event_type = $4
            )
            "#,
        )
        .bind(&self.consumer)
        .bind(key.saga_id.as_uuid())
        .bind(&key.step_name)
        .bind(key.event_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(applied)
    }

    async fn try_apply(&self, key: &IdempotencyKey) -> Result<ApplyOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (consumer, saga_id, step_name, event_type)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&self.consumer)
        .bind(key.saga_id.as_uuid())
        .bind(&key.step_name)
        .bind(key.event_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::AlreadyApplied
        })
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE consumer = $1 AND saga_id = $2 AND step_name = $3 AND event_type = $4
            "#,
        )
        .bind(&self.consumer)
        .bind(key.saga_id.as_uuid())
        .bind(&key.step_name)
        .bind(key.event_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_terminal(&self, saga_id: SagaId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_terminal_sagas (consumer, saga_id, terminal_at)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&self.consumer)
        .bind(saga_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn collect_garbage(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let cutoff = now - retention;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM idempotency_keys k
            USING idempotency_terminal_sagas t
            WHERE k.consumer = $1 AND t.consumer = $1
              AND k.saga_id = t.saga_id
              AND t.terminal_at <= $2
            "#,
        )
        .bind(&self.consumer)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM idempotency_terminal_sagas WHERE consumer = $1 AND terminal_at <= $2",
        )
        .bind(&self.consumer)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if removed > 0 {
            tracing::debug!(consumer = %self.consumer, removed, "Collected idempotency keys");
        }
        Ok(removed as usize)
    }
}
