use axum::extract::{Path, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedController;
use crate::error::EngineError;
use crate::models::*;
use crate::AppState;

use super::ApiResult;

/// GET /api/v1/sections
pub async fn list_sections(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
) -> ApiResult<Vec<Section>> {
    let mut sections = state.store.list_sections().await?;
    sections.sort_by_key(|s| s.id);
    Ok(Json(sections))
}

/// Live view of one section: capacity, occupants and open conflicts.
#[derive(Debug, Serialize)]
pub struct SectionState {
    pub section: Section,
    pub occupancy: u32,
    pub trains: Vec<TrainId>,
    pub open_conflicts: Vec<u64>,
    pub over_capacity: bool,
}

/// GET /api/v1/sections/:section_id/state
pub async fn get_section_state(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Path(section_id): Path<SectionId>,
) -> ApiResult<SectionState> {
    let section = state.store.require_section(section_id).await?;
    let trains = state.store.trains_in_section(section_id).await;
    let open_conflicts: Vec<u64> = state
        .store
        .unresolved_conflicts()
        .await?
        .into_iter()
        .filter(|c| c.sections_involved.contains(&section_id))
        .map(|c| c.id)
        .collect();
    let occupancy = trains.len() as u32;
    let over_capacity = occupancy > section.capacity;
    Ok(Json(SectionState {
        section,
        occupancy,
        trains,
        open_conflicts,
        over_capacity,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSectionRequest {
    pub id: SectionId,
    pub section_code: String,
    pub kind: SectionKind,
    pub length_m: f32,
    pub max_speed_kmh: f32,
    pub capacity: u32,
    pub adjacent_sections: Option<Vec<SectionId>>,
}

/// POST /api/v1/sections: administrative creation; topology is fixed for
/// the lifetime of a run once created.
pub async fn create_section(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Json(request): Json<CreateSectionRequest>,
) -> ApiResult<Section> {
    if !controller.at_least(AuthLevel::Admin) {
        return Err(EngineError::Forbidden("section creation requires ADMIN".into()).into());
    }
    if state.store.get_section(request.id).await?.is_some() {
        return Err(
            EngineError::Validation(format!("section {} already exists", request.id)).into(),
        );
    }
    let mut section = Section::new(request.id, request.section_code, request.kind);
    section.length_m = request.length_m;
    section.max_speed_kmh = request.max_speed_kmh;
    section.capacity = request.capacity;
    section.adjacent_sections = request.adjacent_sections.unwrap_or_default();
    state.store.upsert_section(&section).await?;
    tracing::info!("section {} ({}) created by {}", section.id, section.section_code, controller.id);
    Ok(Json(section))
}

#[derive(Debug, Deserialize)]
pub struct RegisterControllerRequest {
    pub id: ControllerId,
    pub employee_id: String,
    pub auth_level: AuthLevel,
    pub section_responsibility: Vec<SectionId>,
    pub password: String,
}

/// POST /api/v1/controllers: register a controller principal.
pub async fn register_controller(
    State(state): State<AppState>,
    AuthenticatedController(admin): AuthenticatedController,
    Json(request): Json<RegisterControllerRequest>,
) -> ApiResult<serde_json::Value> {
    if !admin.at_least(AuthLevel::Admin) {
        return Err(EngineError::Forbidden("controller registration requires ADMIN".into()).into());
    }
    let mut controller = Controller::new(
        request.id,
        request.employee_id,
        request.auth_level,
        &request.password,
    );
    controller.section_responsibility = request.section_responsibility;
    state.store.upsert_controller(&controller).await?;
    tracing::info!("controller {} registered by {}", controller.id, admin.id);
    Ok(Json(serde_json::json!({ "controller_id": controller.id })))
}
