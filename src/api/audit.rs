use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedController;
use crate::decision::{AuditPage, DecisionAck, LogDecisionRequest};
use crate::error::EngineError;
use crate::models::*;
use crate::storage::DecisionFilter;
use crate::AppState;

use super::ApiResult;

/// POST /api/v1/decisions: direct audit-trail entry.
pub async fn log_decision(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Json(request): Json<LogDecisionRequest>,
) -> ApiResult<DecisionAck> {
    let ack = state.decision_engine.log_decision(&controller, request).await?;
    Ok(Json(ack))
}

/// POST /api/v1/decisions/:decision_id/approve
pub async fn approve_decision(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Path(decision_id): Path<u64>,
) -> ApiResult<DecisionAck> {
    let ack = state.decision_engine.approve(&controller, decision_id).await?;
    Ok(Json(ack))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub controller_id: Option<ControllerId>,
    pub train_id: Option<TrainId>,
    pub conflict_id: Option<u64>,
    pub action: Option<DecisionAction>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub executed: Option<bool>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// GET /api/v1/decisions
pub async fn query_audit(
    State(state): State<AppState>,
    _controller: AuthenticatedController,
    Query(query): Query<AuditQuery>,
) -> ApiResult<AuditPage> {
    let filter = DecisionFilter {
        controller_id: query.controller_id,
        train_id: query.train_id,
        conflict_id: query.conflict_id,
        action: query.action,
        since: query.since,
        until: query.until,
        executed: query.executed,
    };
    let page = state
        .decision_engine
        .query_audit(filter, query.offset.unwrap_or(0), query.limit.unwrap_or(50))
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct MetricsWindow {
    pub hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PerformanceReport {
    pub window_hours: u32,
    pub decisions_in_window: usize,
    pub decisions_executed: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub conflicts_active: usize,
    pub positions_ingested_total: u64,
    pub detection_runs_total: u64,
    pub average_severity: f32,
}

/// GET /api/v1/metrics/performance
pub async fn performance_metrics(
    State(state): State<AppState>,
    AuthenticatedController(controller): AuthenticatedController,
    Query(window): Query<MetricsWindow>,
) -> ApiResult<PerformanceReport> {
    if !controller.at_least(AuthLevel::Supervisor) {
        return Err(EngineError::Forbidden("performance metrics require SUPERVISOR".into()).into());
    }
    let hours = window.hours.unwrap_or(24).clamp(1, 24 * 30);
    let since = chrono::Utc::now() - chrono::Duration::hours(hours as i64);

    let filter = DecisionFilter {
        since: Some(since),
        ..Default::default()
    };
    let (decisions, total) = state.store.query_decisions(&filter, 0, usize::MAX).await?;
    let executed = decisions.iter().filter(|d| d.executed).count();

    let conflicts = state.store.all_conflicts().await?;
    let in_window: Vec<_> = conflicts
        .iter()
        .filter(|c| c.detection_time >= since)
        .collect();
    let resolved = in_window.iter().filter(|c| c.is_resolved()).count();
    let active = conflicts.iter().filter(|c| !c.is_resolved()).count();
    let average_severity = if in_window.is_empty() {
        0.0
    } else {
        in_window.iter().map(|c| c.severity_score as f32).sum::<f32>() / in_window.len() as f32
    };

    Ok(Json(PerformanceReport {
        window_hours: hours,
        decisions_in_window: total,
        decisions_executed: executed,
        conflicts_detected: in_window.len(),
        conflicts_resolved: resolved,
        conflicts_active: active,
        positions_ingested_total: state.metrics.positions_ingested_total.get(),
        detection_runs_total: state.metrics.detection_runs_total.get(),
        average_severity,
    }))
}

/// GET /metrics: Prometheus exposition.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<String, ApiErrorStatus> {
    state.metrics.render().map_err(|_| ApiErrorStatus)
}

pub struct ApiErrorStatus;

impl axum::response::IntoResponse for ApiErrorStatus {
    fn into_response(self) -> axum::response::Response {
        axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}
