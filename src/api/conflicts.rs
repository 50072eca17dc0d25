use axum::extract::{Path, State};
use axum::response::Json;
use serde::Serialize;

use crate::auth::AuthenticatedController;
use crate::decision::{DecisionAck, ResolveRequest};
use crate::detection::scheduler::DetectionDelta;
use crate::error::EngineError;
use crate::models::*;
use crate::AppState;

use super::ApiResult;

/// GET /api/v1/conflicts/active: unresolved conflicts, most urgent first.
pub async fn get_active_conflicts(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
) -> ApiResult<Vec<Conflict>> {
    Ok(Json(state.decision_engine.get_active_conflicts().await?))
}

/// GET /api/v1/conflicts/:conflict_id
pub async fn get_conflict(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Path(conflict_id): Path<u64>,
) -> ApiResult<Conflict> {
    match state.store.get_conflict(conflict_id).await? {
        Some(conflict) => Ok(Json(conflict)),
        None => Err(EngineError::NotFound(format!("conflict {}", conflict_id)).into()),
    }
}

/// POST /api/v1/conflicts/resolve
pub async fn resolve_conflict(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<DecisionAck> {
    let ack = state.decision_engine.resolve_conflict(&controller, request).await?;
    Ok(Json(ack))
}

#[derive(Debug, Serialize)]
pub struct DetectionSummary {
    pub new_conflicts: usize,
    pub updated_conflicts: usize,
    pub alerts_emitted: usize,
    pub conflicts: Vec<Conflict>,
}

impl From<DetectionDelta> for DetectionSummary {
    fn from(delta: DetectionDelta) -> Self {
        Self {
            new_conflicts: delta.new_conflicts.len(),
            updated_conflicts: delta.updated_conflicts.len(),
            alerts_emitted: delta.alerts_emitted,
            conflicts: delta
                .new_conflicts
                .into_iter()
                .chain(delta.updated_conflicts)
                .collect(),
        }
    }
}

/// POST /api/v1/conflicts/detect: manual detection run, rate-limited
/// system-wide; returns the delta synchronously.
pub async fn run_detection(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
) -> ApiResult<DetectionSummary> {
    if !controller.at_least(AuthLevel::Supervisor) {
        return Err(EngineError::Forbidden("manual detection requires SUPERVISOR".into()).into());
    }
    let delta = state.scheduler.run_detection_once().await?;
    Ok(Json(delta.into()))
}

/// POST /api/v1/conflicts/:conflict_id/recommend: consult the recommender
/// strategies for this conflict.
pub async fn recommend(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Path(conflict_id): Path<u64>,
) -> ApiResult<crate::ai::Recommendation> {
    if !controller.at_least(AuthLevel::Operator) {
        return Err(EngineError::Forbidden("recommendations require OPERATOR".into()).into());
    }
    Ok(Json(state.decision_engine.recommend(conflict_id).await?))
}
