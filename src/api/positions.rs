use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;

use crate::auth::AuthenticatedController;
use crate::error::EngineError;
use crate::ingestion::PositionAck;
use crate::models::*;
use crate::AppState;

use super::ApiResult;

/// POST /api/v1/positions
pub async fn report_position(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Json(report): Json<PositionReport>,
) -> ApiResult<PositionAck> {
    let ack = state.pipeline.report_position(report).await?;
    Ok(Json(ack))
}

/// POST /api/v1/positions/bulk
pub async fn report_bulk(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Json(reports): Json<Vec<PositionReport>>,
) -> ApiResult<BulkReport> {
    Ok(Json(state.pipeline.report_bulk(reports).await))
}

/// POST /api/v1/positions/queue: fire-and-forget intake with backpressure.
pub async fn enqueue_position(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Json(report): Json<PositionReport>,
) -> ApiResult<serde_json::Value> {
    state.pipeline.enqueue(report).await?;
    Ok(Json(serde_json::json!({ "queued": true })))
}

/// GET /api/v1/trains/:train_id/position
pub async fn current_position(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Path(train_id): Path<TrainId>,
) -> ApiResult<PositionReport> {
    match state.pipeline.current_position(train_id).await {
        Some(report) => Ok(Json(report)),
        None => Err(EngineError::NotFound(format!("no position for train {}", train_id)).into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub hours: Option<u32>,
}

/// GET /api/v1/trains/:train_id/positions
pub async fn position_history(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Path(train_id): Path<TrainId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<PositionReport>> {
    let hours = query.hours.unwrap_or(24).min(24 * 30);
    let since = chrono::Utc::now() - chrono::Duration::hours(hours as i64);
    let reports = state.store.positions_for_train(train_id, since).await?;
    Ok(Json(reports))
}

/// GET /api/v1/sections/:section_id/trains
pub async fn trains_in_section(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Path(section_id): Path<SectionId>,
) -> ApiResult<Vec<TrainId>> {
    Ok(Json(state.pipeline.trains_in_section(section_id).await))
}

/// GET /api/v1/occupancies
pub async fn open_occupancies(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
) -> ApiResult<Vec<OccupancyRecord>> {
    Ok(Json(state.pipeline.open_occupancies().await))
}
