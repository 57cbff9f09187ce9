//! Saga start and inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{SagaId, SagaState};
use event_bus::InMemoryEventBus;
use saga::{Orchestrator, SagaError, StepFailure};
use saga_store::{HistoryEntry, IdempotencyTracker, SagaQuery, SagaRecord, SagaStore};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore, I: IdempotencyTracker> {
    pub orchestrator: Arc<Orchestrator<S, InMemoryEventBus, I>>,
    /// Name of the saga store backend, reported by the health check.
    pub backend: &'static str,
}

// -- Request types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSagaRequest {
    pub saga_type: String,
    pub reference_id: String,
    /// Either a string holding serialized data, used as-is, or any JSON value.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StartSagaRequest {
    fn payload_bytes(&self) -> Result<Vec<u8>, ApiError> {
        match &self.payload {
            serde_json::Value::String(raw) => Ok(raw.clone().into_bytes()),
            serde_json::Value::Null => Ok(Vec::new()),
            value => serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string())),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub saga_type: Option<String>,
    pub state: Option<String>,
    pub reference_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// -- Response types --

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSagaResponse {
    pub saga_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaResponse {
    pub saga_id: String,
    pub saga_type: String,
    pub reference_id: String,
    pub state: SagaState,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub pending_compensations: Vec<String>,
    pub payload: serde_json::Value,
    pub failure: Option<StepFailure>,
    pub step_deadline: Option<DateTime<Utc>>,
    pub unpublished: usize,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    pub reason: String,
    pub consumer_group: Option<String>,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub payload: String,
}

fn to_response<S: SagaStore + 'static, I: IdempotencyTracker + 'static>(
    state: &AppState<S, I>,
    record: SagaRecord,
) -> SagaResponse {
    let current_step = if record.state.is_awaiting_step() {
        state
            .orchestrator
            .registry()
            .get(&record.saga_type)
            .and_then(|definition| definition.step(record.current_step_index))
            .map(String::from)
    } else {
        None
    };

    SagaResponse {
        saga_id: record.saga_id.to_string(),
        saga_type: record.saga_type,
        reference_id: record.reference_id,
        state: record.state,
        current_step,
        completed_steps: record.completed_steps,
        pending_compensations: record.pending_compensations,
        payload: payload_json(&record.payload),
        failure: record
            .failure_payload
            .and_then(|bytes| serde_json::from_slice(&bytes).ok()),
        step_deadline: record.step_deadline,
        unpublished: record.outbox.len(),
        version: record.version.as_i64(),
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

/// Renders opaque payload bytes: JSON when they parse, text otherwise.
fn payload_json(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// -- Handlers --

/// POST /api/sagas/start: create a saga and publish its START.
#[tracing::instrument(skip(state, req))]
pub async fn start<S: SagaStore + 'static, I: IdempotencyTracker + 'static>(
    State(state): State<Arc<AppState<S, I>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<StartSagaResponse>), ApiError> {
    if req.reference_id.trim().is_empty() {
        return Err(ApiError::BadRequest("referenceId is required".to_string()));
    }

    let payload = req.payload_bytes()?;
    let result = state
        .orchestrator
        .start_saga(&req.saga_type, &req.reference_id, payload)
        .await;

    let outcome = match &result {
        Ok(_) => "accepted",
        Err(SagaError::DuplicateReferenceId { .. }) => "duplicate",
        Err(_) => "rejected",
    };
    metrics::counter!("saga_start_requests_total", "outcome" => outcome).increment(1);
    let saga_id = result?;

    Ok((
        StatusCode::CREATED,
        Json(StartSagaResponse {
            saga_id: saga_id.to_string(),
        }),
    ))
}

/// GET /api/sagas/{id}: current status of a saga.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + 'static, I: IdempotencyTracker + 'static>(
    State(state): State<Arc<AppState<S, I>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let record = state
        .orchestrator
        .get_saga(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;

    Ok(Json(to_response(&state, record)))
}

/// GET /api/sagas/{id}/history: every event the saga saw or emitted.
#[tracing::instrument(skip(state))]
pub async fn history<S: SagaStore + 'static, I: IdempotencyTracker + 'static>(
    State(state): State<Arc<AppState<S, I>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.orchestrator.history(saga_id).await?))
}

/// GET /api/sagas: list sagas, optionally filtered.
#[tracing::instrument(skip(state, params))]
pub async fn list<S: SagaStore + 'static, I: IdempotencyTracker + 'static>(
    State(state): State<Arc<AppState<S, I>>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<SagaResponse>>, ApiError> {
    let mut query = SagaQuery::new().limit(params.limit.unwrap_or(100).min(1000));
    if let Some(saga_type) = params.saga_type {
        query = query.saga_type(saga_type);
    }
    if let Some(raw) = params.state {
        let saga_state = SagaState::parse(&raw)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown saga state: {raw}")))?;
        query = query.state(saga_state);
    }
    if let Some(reference_id) = params.reference_id {
        query = query.reference_id(reference_id);
    }
    if let Some(offset) = params.offset {
        query = query.offset(offset);
    }

    let records = state.orchestrator.list(query).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|record| to_response(&state, record))
            .collect(),
    ))
}

/// GET /api/dead-letters: messages given up on.
pub async fn dead_letters<S: SagaStore + 'static, I: IdempotencyTracker + 'static>(
    State(state): State<Arc<AppState<S, I>>>,
) -> Json<Vec<DeadLetterResponse>> {
    let letters = state.orchestrator.dead_letters().entries().await;
    Json(
        letters
            .into_iter()
            .map(|letter| DeadLetterResponse {
                reason: letter.reason,
                consumer_group: letter.consumer_group,
                attempts: letter.attempts,
                failed_at: letter.failed_at,
                payload: String::from_utf8_lossy(&letter.payload).into_owned(),
            })
            .collect(),
    )
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}
