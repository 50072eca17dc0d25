use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;

use crate::auth::AuthenticatedController;
use crate::decision::{ControlRequest, DecisionAck};
use crate::error::EngineError;
use crate::models::*;
use crate::AppState;

use super::ApiResult;

/// POST /api/v1/trains/control
pub async fn control_train(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Json(request): Json<ControlRequest>,
) -> ApiResult<DecisionAck> {
    let ack = state.decision_engine.control_train(&controller, request).await?;
    Ok(Json(ack))
}

/// GET /api/v1/trains
pub async fn list_trains(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
) -> ApiResult<Vec<Train>> {
    let mut trains = state.store.list_trains().await?;
    trains.sort_by_key(|t| t.id);
    Ok(Json(trains))
}

/// GET /api/v1/trains/:train_id
pub async fn get_train(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Path(train_id): Path<TrainId>,
) -> ApiResult<Train> {
    Ok(Json(state.store.require_train(train_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateTrainRequest {
    pub id: TrainId,
    pub train_number: String,
    pub kind: TrainKind,
    pub priority: u8,
    pub max_speed_kmh: Option<f32>,
    pub capacity: Option<u32>,
    pub length_m: Option<f32>,
    pub weight_t: Option<f32>,
    pub route: Option<Vec<SectionId>>,
}

/// POST /api/v1/trains: administrative creation.
pub async fn create_train(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Json(request): Json<CreateTrainRequest>,
) -> ApiResult<Train> {
    if !controller.at_least(AuthLevel::Admin) {
        return Err(EngineError::Forbidden("train creation requires ADMIN".into()).into());
    }
    if state.store.get_train(request.id).await?.is_some() {
        return Err(EngineError::Validation(format!("train {} already exists", request.id)).into());
    }
    let mut train = Train::new(request.id, request.train_number, request.kind, request.priority);
    if let Some(v) = request.max_speed_kmh {
        train.max_speed_kmh = v;
    }
    if let Some(v) = request.capacity {
        train.capacity = v;
    }
    if let Some(v) = request.length_m {
        train.length_m = v;
    }
    if let Some(v) = request.weight_t {
        train.weight_t = v;
    }
    if let Some(route) = request.route {
        train.route = route;
    }
    state.store.upsert_train(&train).await?;
    tracing::info!("train {} ({}) created by {}", train.id, train.train_number, controller.id);
    Ok(Json(train))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTrainRequest {
    pub priority: Option<u8>,
    pub operational_status: Option<TrainStatus>,
    pub current_load: Option<u32>,
    pub route: Option<Vec<SectionId>>,
}

/// PUT /api/v1/trains/:train_id: mutate the administrative fields.
pub async fn update_train(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Path(train_id): Path<TrainId>,
    Json(request): Json<UpdateTrainRequest>,
) -> ApiResult<Train> {
    if !controller.at_least(AuthLevel::Admin) {
        return Err(EngineError::Forbidden("train updates require ADMIN".into()).into());
    }
    let mut train = state.store.require_train(train_id).await?;
    if let Some(priority) = request.priority {
        train.priority = priority;
    }
    if let Some(status) = request.operational_status {
        train.operational_status = status;
    }
    if let Some(load) = request.current_load {
        train.current_load = load;
    }
    if let Some(route) = request.route {
        train.route = route;
    }
    train.updated_at = chrono::Utc::now();
    state.store.upsert_train(&train).await?;
    Ok(Json(train))
}

/// DELETE /api/v1/trains/:train_id
pub async fn delete_train(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Path(train_id): Path<TrainId>,
) -> ApiResult<serde_json::Value> {
    if !controller.at_least(AuthLevel::Admin) {
        return Err(EngineError::Forbidden("train deletion requires ADMIN".into()).into());
    }
    let removed = state.store.delete_train(train_id).await?;
    if !removed {
        return Err(EngineError::NotFound(format!("train {}", train_id)).into());
    }
    tracing::info!("train {} deleted by {}", train_id, controller.id);
    Ok(Json(serde_json::json!({ "deleted": train_id })))
}
