//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_store::{IdempotencyTracker, SagaStore};
use serde::Serialize;

use crate::routes::sagas::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub pending_deadlines: usize,
    pub dead_letters: usize,
}

/// GET /health: returns system health status.
pub async fn check<S: SagaStore + 'static, I: IdempotencyTracker + 'static>(
    State(state): State<Arc<AppState<S, I>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.backend,
        pending_deadlines: state.orchestrator.pending_deadlines().await,
        dead_letters: state.orchestrator.dead_letters().len().await,
    })
}
